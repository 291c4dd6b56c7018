//! Operation queue inspection and operator actions.

use anyhow::{Context, Result};
use console::style;
use tickflow::config::TickflowConfig;
use tickflow::queue::OperationQueue;
use tickflow::store::OperationStatus;

fn queue(config: &TickflowConfig) -> Result<OperationQueue> {
    let store = super::open_store(config)?;
    Ok(OperationQueue::new(store, config.toml.queue.clone())
        .with_holder(config.holder_id())
        .with_lock_config(config.toml.lock.clone()))
}

pub fn cmd_ops(
    config: &TickflowConfig,
    kind: Option<&str>,
    status: Option<OperationStatus>,
) -> Result<()> {
    let ops = queue(config)?.list(kind, status)?;
    if ops.is_empty() {
        println!("No operations.");
        return Ok(());
    }

    println!("{:<6} {:<12} {:<9} {:<20} Error", "Id", "Kind", "Status", "Created");
    println!("{:<6} {:<12} {:<9} {:<20} -----", "------", "------------", "---------", "--------------------");
    for op in &ops {
        let status = match op.status {
            OperationStatus::Failed => style(op.status.as_str()).red(),
            OperationStatus::Done => style(op.status.as_str()).green(),
            OperationStatus::Running => style(op.status.as_str()).cyan(),
            OperationStatus::Pending => style(op.status.as_str()).dim(),
        };
        println!(
            "{:<6} {:<12} {:<9} {:<20} {}",
            op.id,
            op.kind,
            status,
            op.created_at.format("%Y-%m-%d %H:%M:%S"),
            op.error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub fn cmd_enqueue(config: &TickflowConfig, kind: &str, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload must be valid JSON")?;
    let id = queue(config)?.enqueue(kind, payload)?;
    println!("Enqueued operation {} ({})", id, kind);
    Ok(())
}

pub fn cmd_retry(config: &TickflowConfig, id: i64) -> Result<()> {
    let new_id = queue(config)?.retry(id)?;
    println!("Operation {} re-enqueued as {}", id, new_id);
    Ok(())
}
