//! Declared workflow shape: how many phases, and how many steps in each.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::store::{Query, Record, Store, Table};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseShape {
    /// Number of sequential steps in the phase.
    pub steps: u32,
    /// Display name; not persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowShape {
    pub phases: Vec<PhaseShape>,
}

impl WorkflowShape {
    /// `phases` phases of `steps` steps each.
    pub fn uniform(phases: u32, steps: u32) -> Self {
        Self {
            phases: (0..phases)
                .map(|_| PhaseShape { steps, name: None })
                .collect(),
        }
    }

    pub fn from_steps(steps: &[u32]) -> Self {
        Self {
            phases: steps
                .iter()
                .map(|&steps| PhaseShape { steps, name: None })
                .collect(),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse workflow shape")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read shape file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid shape in {}", path.display()))
    }

    /// Rebuild the shape from rows already in the store, for processes that
    /// resume a workflow someone else initialized.
    pub fn from_store(store: &Store) -> Result<Self, StoreError> {
        let rows = store.read_many(&[Query::Table(Table::Phases), Query::Table(Table::Steps)])?;
        let phase_count = rows[0].iter().filter_map(Record::as_phase).count();
        let mut steps = vec![0u32; phase_count];
        for step in rows[1].iter().filter_map(Record::as_step) {
            if let Some(count) = steps.get_mut(step.phase_index as usize) {
                *count = (*count).max(step.index + 1);
            }
        }
        Ok(Self::from_steps(&steps))
    }

    pub fn phase_count(&self) -> u32 {
        self.phases.len() as u32
    }

    pub fn steps_in(&self, phase_index: u32) -> Option<u32> {
        self.phases.get(phase_index as usize).map(|p| p.steps)
    }

    pub fn is_last_step(&self, phase_index: u32, step_index: u32) -> bool {
        self.steps_in(phase_index)
            .is_some_and(|n| step_index + 1 == n)
    }

    pub fn name_of(&self, phase_index: u32) -> String {
        self.phases
            .get(phase_index as usize)
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| format!("phase {}", phase_index))
    }
}
