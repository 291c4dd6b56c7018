//! Workflow initialization: `tickflow init`.

use anyhow::{Result, bail};
use std::path::Path;
use tickflow::config::TickflowConfig;
use tickflow::scheduler::{Scheduler, WorkflowShape};

pub fn cmd_init(
    config: &TickflowConfig,
    shape_file: Option<&Path>,
    phases: Option<u32>,
    steps: Option<u32>,
) -> Result<()> {
    let shape = match (shape_file, phases, steps) {
        (Some(path), _, _) => WorkflowShape::load(path)?,
        (None, Some(phases), Some(steps)) => WorkflowShape::uniform(phases, steps),
        _ => bail!("Provide a shape with --shape <file> or --phases N --steps M"),
    };
    if shape.phases.is_empty() {
        bail!("Workflow shape has no phases");
    }

    std::fs::create_dir_all(&config.config_dir)?;
    let store = super::open_store(config)?;
    let scheduler = Scheduler::new(store, shape, config.toml.scheduler.clone());
    let created = scheduler.initialize()?;

    println!();
    println!("Database: {}", config.db_path().display());
    if created == 0 {
        println!("Workflow already initialized; nothing to create.");
    } else {
        println!(
            "Created {} rows for {} phases ({} steps).",
            created,
            scheduler.shape().phase_count(),
            scheduler
                .shape()
                .phases
                .iter()
                .map(|p| p.steps)
                .sum::<u32>()
        );
    }
    println!();
    println!("Run 'tickflow tick' to activate the first phase.");
    println!();
    Ok(())
}
