//! Configuration view and validation commands: `tickflow config`.

use anyhow::Result;

use super::super::ConfigCommands;
use tickflow::config::{CONFIG_FILE, TickflowConfig, TickflowToml};

pub fn cmd_config(config: &TickflowConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Tickflow Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No tickflow.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            print_toml(&config.toml);

            // Show effective values (including env overrides)
            println!("Effective values (with env/CLI overrides):");
            println!("  database = \"{}\"", config.db_path().display());
            println!("  holder_id = \"{}\"", config.holder_id());
            println!();
            if !config_path.exists() {
                println!("Run 'tickflow config init' to create a tickflow.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No tickflow.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = TickflowToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("tickflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.config_dir)?;
            TickflowToml::default().save(&config_path)?;

            println!("Created tickflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [scheduler] max_conflict_retries, poll_interval_ms");
            println!("  - [queue] default_policy and [queue.policies] per resource-class");
            println!("  - [lock] backoff_secs, stale_after_secs, heartbeat_secs");
            println!();
        }
    }

    Ok(())
}

fn print_toml(toml: &TickflowToml) {
    if let Some(path) = &toml.store.path {
        println!("[store]");
        println!("  path = \"{}\"", path.display());
        println!();
    }

    println!("[scheduler]");
    println!("  max_conflict_retries = {}", toml.scheduler.max_conflict_retries);
    println!("  poll_interval_ms = {}", toml.scheduler.poll_interval_ms);
    println!();

    println!("[queue]");
    println!("  default_policy = \"{}\"", toml.queue.default_policy);
    println!("  poll_interval_ms = {}", toml.queue.poll_interval_ms);
    let mut policies: Vec<_> = toml.queue.policies.iter().collect();
    policies.sort_by_key(|(kind, _)| *kind);
    for (kind, policy) in policies {
        println!("  policies.{} = \"{}\"", kind, policy);
    }
    println!();

    println!("[lock]");
    println!("  backoff_secs = {}", toml.lock.backoff_secs);
    println!("  stale_after_secs = {}", toml.lock.stale_after_secs);
    println!("  heartbeat_secs = {}", toml.lock.heartbeat_secs);
    println!("  max_attempts = {}", toml.lock.max_attempts);
    println!();
}
