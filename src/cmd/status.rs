//! Progress view, single scheduler pass and transition log.

use anyhow::Result;
use console::style;
use tickflow::config::TickflowConfig;
use tickflow::scheduler::{Scheduler, SchedulerEvent, Snapshot, WorkflowShape};
use tickflow::store::{PhaseStatus, Record, StepStatus};

pub fn cmd_status(config: &TickflowConfig, json: bool) -> Result<()> {
    let Some(store) = super::open_existing_store(config)? else {
        return Ok(());
    };
    let snap = Snapshot::read(&store)?;
    let summary = snap.summary();

    if json {
        let steps: Vec<_> = snap.steps.values().flatten().collect();
        let out = serde_json::json!({
            "summary": summary,
            "phases": snap.phases,
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", summary);
    println!();
    if snap.phases.is_empty() {
        println!("No phases found. Run 'tickflow init' first.");
        println!();
        return Ok(());
    }

    println!("{:<8} {:<10} Steps", "Phase", "Status");
    println!("{:<8} {:<10} -----", "--------", "----------");
    for phase in &snap.phases {
        let status = match phase.status {
            PhaseStatus::Active => style(phase.status.as_str()).cyan().bold(),
            PhaseStatus::Completed => style(phase.status.as_str()).green(),
            PhaseStatus::Skipped => style(phase.status.as_str()).yellow(),
            PhaseStatus::Pending => style(phase.status.as_str()).dim(),
        };
        let steps: Vec<String> = snap
            .steps_of(phase.index)
            .iter()
            .map(|step| {
                let count = snap.task_count(step.phase_index, step.index);
                let marker = match step.status {
                    StepStatus::Pending => " ",
                    StepStatus::Active => "*",
                    StepStatus::Completed => "✓",
                };
                format!("{}{} ({}/{})", marker, step.index, count.total - count.outstanding, count.total)
            })
            .collect();
        println!("{:<8} {:<10} {}", phase.index, status, steps.join("  "));
    }
    println!();

    for problem in snap.check_invariants() {
        println!("{} {}", style("invariant violated:").red().bold(), problem);
    }
    Ok(())
}

pub fn cmd_tick(config: &TickflowConfig) -> Result<()> {
    let Some(store) = super::open_existing_store(config)? else {
        return Ok(());
    };
    let shape = WorkflowShape::from_store(&store)?;
    let mut scheduler = Scheduler::new(store, shape, config.toml.scheduler.clone());
    let report = scheduler.tick()?;

    println!();
    if report.events.is_empty() {
        println!("No transitions.");
    }
    for event in &report.events {
        println!("  {}", describe_event(event));
    }
    if report.conflicts > 0 {
        println!(
            "{}",
            style(format!("{} CAS conflicts retried", report.conflicts)).dim()
        );
    }
    if report.finished {
        println!();
        println!("{}", style("Workflow completed.").green().bold());
    }
    println!();
    Ok(())
}

pub fn cmd_log(config: &TickflowConfig, since: i64, limit: usize) -> Result<()> {
    let Some(store) = super::open_existing_store(config)? else {
        return Ok(());
    };
    let entries = store.changes_since(since, limit)?;
    if entries.is_empty() {
        println!("No changes after #{}.", since);
        return Ok(());
    }
    println!(
        "{:<6} {:<20} {:<28} Transition",
        "Seq", "Time", "Row"
    );
    for entry in &entries {
        println!(
            "{:<6} {:<20} {:<28} {} -> {}",
            entry.seq,
            entry.changed_at.format("%Y-%m-%d %H:%M:%S"),
            entry.key.to_string(),
            style(describe_record(entry.old.as_ref())).dim(),
            describe_record(entry.new.as_ref())
        );
    }
    Ok(())
}

fn describe_event(event: &SchedulerEvent) -> String {
    match event {
        SchedulerEvent::PhaseActivated { phase } => format!("phase {} activated", phase),
        SchedulerEvent::PhaseSkipped { phase } => format!("phase {} skipped", phase),
        SchedulerEvent::PhaseCompleted { phase } => format!("phase {} completed", phase),
        SchedulerEvent::StepActivated { phase, step } => {
            format!("step {}:{} activated", phase, step)
        }
        SchedulerEvent::StepCompleted { phase, step } => {
            format!("step {}:{} completed", phase, step)
        }
        SchedulerEvent::WorkflowCompleted => "workflow completed".to_string(),
    }
}

/// Short status text for one side of a transition.
fn describe_record(record: Option<&Record>) -> String {
    match record {
        None => "(none)".to_string(),
        Some(Record::Phase(p)) => p.status.to_string(),
        Some(Record::Step(s)) => s.status.to_string(),
        Some(Record::Task(t)) => t.status.to_string(),
        Some(Record::Operation(o)) => match &o.error {
            Some(error) => format!("{} ({})", o.status, error),
            None => o.status.to_string(),
        },
        Some(Record::Lock(l)) => match &l.holder_id {
            Some(holder) => format!("{} by {}", l.status, holder),
            None => l.status.to_string(),
        },
        Some(Record::Workflow(w)) => w.status.to_string(),
    }
}
