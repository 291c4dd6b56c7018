//! Singleton lock inspection and operator overrides.

use anyhow::Result;
use chrono::Utc;
use console::style;
use tickflow::config::TickflowConfig;
use tickflow::lock::SingletonLock;
use tickflow::store::LockStatus;

pub fn cmd_lock(
    config: &TickflowConfig,
    resource: &str,
    mark_stale: bool,
    force_release: bool,
) -> Result<()> {
    let store = super::open_store(config)?;
    let lock = SingletonLock::new(
        store,
        resource,
        config.holder_id(),
        config.toml.lock.stale_after(),
    );

    if force_release {
        match lock.force_release()? {
            Some(holder) => println!("Released '{}' (was held by {})", resource, holder),
            None => println!("'{}' is already idle", resource),
        }
        return Ok(());
    }
    if mark_stale {
        if lock.mark_stale_if_expired()? {
            println!("Marked '{}' stale", resource);
        } else {
            println!("'{}' is not an expired claim; left unchanged", resource);
        }
    }

    let row = lock.status()?;
    let status = match row.status {
        LockStatus::Idle => style(row.status.as_str()).green(),
        LockStatus::Claimed => style(row.status.as_str()).cyan(),
        LockStatus::Stale => style(row.status.as_str()).red(),
    };
    println!();
    println!("Resource:  {}", row.resource_id);
    println!("Status:    {}", status);
    if let Some(holder) = &row.holder_id {
        println!("Holder:    {}", holder);
    }
    if let Some(claimed) = row.claimed_at {
        println!("Claimed:   {}", claimed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(heartbeat) = row.last_heartbeat {
        let age = Utc::now() - heartbeat;
        println!(
            "Heartbeat: {} ({}s ago)",
            heartbeat.format("%Y-%m-%d %H:%M:%S"),
            age.num_seconds()
        );
    }
    if row.status == LockStatus::Claimed && lock.is_expired(&row) {
        println!("{}", style("Holder heartbeat expired; claim may be reclaimed.").yellow());
    }
    println!();
    Ok(())
}
