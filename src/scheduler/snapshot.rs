//! Point-in-time view of the workflow rows, read under one transaction.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::errors::StoreError;
use crate::store::{
    PhaseRow, PhaseStatus, Query, Record, RowKey, StepRow, StepStatus, Store, Table, WorkflowRow,
    WorkflowStatus, step_id,
};

/// Task counts for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCount {
    pub total: usize,
    /// Tasks not yet Completed or Failed.
    pub outstanding: usize,
}

impl TaskCount {
    /// At least one task exists and none is outstanding.
    pub fn drained(&self) -> bool {
        self.total > 0 && self.outstanding == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub phases: Vec<PhaseRow>,
    pub steps: BTreeMap<u32, Vec<StepRow>>,
    pub tasks: HashMap<String, TaskCount>,
    /// Tasks without a step.
    pub unassigned_tasks: usize,
    pub workflow: Option<WorkflowRow>,
}

impl Snapshot {
    pub fn read(store: &Store) -> Result<Self, StoreError> {
        let mut rows = store
            .read_many(&[
                Query::Table(Table::Phases),
                Query::Table(Table::Steps),
                Query::Table(Table::Tasks),
                Query::Row(RowKey::workflow()),
            ])?
            .into_iter();
        let mut snapshot = Snapshot::default();

        for record in rows.next().unwrap_or_default() {
            if let Record::Phase(phase) = record {
                snapshot.phases.push(phase);
            }
        }
        for record in rows.next().unwrap_or_default() {
            if let Record::Step(step) = record {
                snapshot.steps.entry(step.phase_index).or_default().push(step);
            }
        }
        for record in rows.next().unwrap_or_default() {
            if let Record::Task(task) = record {
                match task.step_id {
                    Some(id) => {
                        let count = snapshot.tasks.entry(id).or_default();
                        count.total += 1;
                        if !task.status.is_terminal() {
                            count.outstanding += 1;
                        }
                    }
                    None => snapshot.unassigned_tasks += 1,
                }
            }
        }
        snapshot.workflow = rows
            .next()
            .unwrap_or_default()
            .into_iter()
            .find_map(|r| r.as_workflow().cloned());
        Ok(snapshot)
    }

    pub fn phase(&self, index: u32) -> Option<&PhaseRow> {
        self.phases.iter().find(|p| p.index == index)
    }

    pub fn active_phases(&self) -> Vec<&PhaseRow> {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Active)
            .collect()
    }

    pub fn active_phase(&self) -> Option<&PhaseRow> {
        self.phases.iter().find(|p| p.status == PhaseStatus::Active)
    }

    /// Smallest phase that is neither Completed nor Skipped.
    pub fn first_open_phase(&self) -> Option<&PhaseRow> {
        self.phases.iter().find(|p| !p.status.is_terminal())
    }

    pub fn steps_of(&self, phase_index: u32) -> &[StepRow] {
        self.steps
            .get(&phase_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn step(&self, phase_index: u32, index: u32) -> Option<&StepRow> {
        self.steps_of(phase_index).iter().find(|s| s.index == index)
    }

    pub fn active_step(&self) -> Option<&StepRow> {
        self.steps
            .values()
            .flatten()
            .find(|s| s.status == StepStatus::Active)
    }

    pub fn task_count(&self, phase_index: u32, step_index: u32) -> TaskCount {
        self.tasks
            .get(&step_id(phase_index, step_index))
            .copied()
            .unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.workflow
            .as_ref()
            .is_some_and(|w| w.status == WorkflowStatus::Completed)
    }

    /// Violations of the single-active-phase / single-active-step rules.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let active = self.active_phases();
        if active.len() > 1 {
            problems.push(format!("{} phases are active", active.len()));
        }
        if let Some(phase) = active.first()
            && let Some(open) = self.first_open_phase()
            && open.index != phase.index
        {
            problems.push(format!(
                "phase {} is active but phase {} is still open",
                phase.index, open.index
            ));
        }
        for (phase_index, steps) in &self.steps {
            let active_steps = steps
                .iter()
                .filter(|s| s.status == StepStatus::Active)
                .count();
            if active_steps > 1 {
                problems.push(format!("phase {} has {} active steps", phase_index, active_steps));
            }
            let phase_active = self
                .phase(*phase_index)
                .is_some_and(|p| p.status == PhaseStatus::Active);
            if active_steps > 0 && !phase_active {
                problems.push(format!("phase {} is not active but has an active step", phase_index));
            }
        }
        problems
    }

    pub fn summary(&self) -> Summary {
        let count = |status: PhaseStatus| self.phases.iter().filter(|p| p.status == status).count();
        Summary {
            phases: self.phases.len(),
            completed: count(PhaseStatus::Completed),
            skipped: count(PhaseStatus::Skipped),
            active_phase: self.active_phase().map(|p| p.index),
            active_step: self.active_step().map(|s| (s.phase_index, s.index)),
            tasks_total: self.tasks.values().map(|c| c.total).sum::<usize>() + self.unassigned_tasks,
            tasks_outstanding: self.tasks.values().map(|c| c.outstanding).sum(),
            workflow: self.workflow.as_ref().map(|w| w.status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub phases: usize,
    pub completed: usize,
    pub skipped: usize,
    pub active_phase: Option<u32>,
    pub active_step: Option<(u32, u32)>,
    pub tasks_total: usize,
    pub tasks_outstanding: usize,
    pub workflow: Option<WorkflowStatus>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let workflow = self
            .workflow
            .map(|w| w.to_string())
            .unwrap_or_else(|| "uninitialized".to_string());
        write!(
            f,
            "{}: {}/{} phases done ({} skipped)",
            workflow,
            self.completed + self.skipped,
            self.phases,
            self.skipped
        )?;
        if let Some((phase, step)) = self.active_step {
            write!(f, ", active step {}:{}", phase, step)?;
        } else if let Some(phase) = self.active_phase {
            write!(f, ", active phase {}", phase)?;
        }
        write!(
            f,
            ", {} of {} tasks outstanding",
            self.tasks_outstanding, self.tasks_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TaskRow, TaskStatus};

    fn insert(store: &Store, record: Record) {
        assert!(store.insert_if_absent(&record).unwrap().is_applied());
    }

    #[test]
    fn test_task_counts_group_by_step() {
        let store = Store::open_in_memory().unwrap();
        let step = Some(step_id(0, 0));
        insert(&store, Record::Task(TaskRow::new("a", step.clone())));
        insert(
            &store,
            Record::Task(TaskRow::new("b", step.clone()).with_status(TaskStatus::Completed)),
        );
        insert(
            &store,
            Record::Task(TaskRow::new("c", step).with_status(TaskStatus::Failed)),
        );
        insert(&store, Record::Task(TaskRow::new("d", None)));

        let snap = Snapshot::read(&store).unwrap();
        let count = snap.task_count(0, 0);
        assert_eq!(count, TaskCount { total: 3, outstanding: 1 });
        assert!(!count.drained());
        assert_eq!(snap.unassigned_tasks, 1);
        assert_eq!(snap.task_count(1, 0), TaskCount::default());
        assert!(!snap.task_count(1, 0).drained());
    }

    #[test]
    fn test_invariant_check_flags_two_active_phases() {
        let store = Store::open_in_memory().unwrap();
        insert(&store, Record::Phase(PhaseRow::pending(0).with_status(PhaseStatus::Active)));
        insert(&store, Record::Phase(PhaseRow::pending(1).with_status(PhaseStatus::Active)));
        let snap = Snapshot::read(&store).unwrap();
        let problems = snap.check_invariants();
        assert!(problems.iter().any(|p| p.contains("2 phases are active")));
    }

    #[test]
    fn test_summary_display() {
        let store = Store::open_in_memory().unwrap();
        insert(&store, Record::Phase(PhaseRow::pending(0).with_status(PhaseStatus::Completed)));
        insert(&store, Record::Phase(PhaseRow::pending(1).with_status(PhaseStatus::Active)));
        insert(&store, Record::Step(StepRow::pending(1, 0).with_status(StepStatus::Active)));
        insert(&store, Record::Task(TaskRow::new("t", Some(step_id(1, 0)))));
        insert(
            &store,
            Record::Workflow(WorkflowRow {
                status: WorkflowStatus::Running,
            }),
        );
        let summary = Snapshot::read(&store).unwrap().summary();
        assert_eq!(summary.active_step, Some((1, 0)));
        assert_eq!(
            summary.to_string(),
            "running: 1/2 phases done (0 skipped), active step 1:0, 1 of 1 tasks outstanding"
        );
    }
}
