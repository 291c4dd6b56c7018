//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                 |
//! |-----------------|----------------------------------|
//! | `project`       | `Init`                           |
//! | `status`        | `Status`, `Tick`, `Log`          |
//! | `ops`           | `Ops`, `Enqueue`, `Retry`        |
//! | `lock`          | `Lock`                           |
//! | `config`        | `Config`                         |

pub mod config;
pub mod lock;
pub mod ops;
pub mod project;
pub mod status;

pub use config::cmd_config;
pub use lock::cmd_lock;
pub use ops::{cmd_enqueue, cmd_ops, cmd_retry};
pub use project::cmd_init;
pub use status::{cmd_log, cmd_status, cmd_tick};

use anyhow::{Context, Result};
use tickflow::config::TickflowConfig;
use tickflow::store::Store;

/// Open the configured database, creating it if needed.
fn open_store(config: &TickflowConfig) -> Result<Store> {
    let path = config.db_path();
    Store::open(&path).with_context(|| format!("Failed to open store at {}", path.display()))
}

/// Open the configured database only if it already exists.
fn open_existing_store(config: &TickflowConfig) -> Result<Option<Store>> {
    if !config.db_path().exists() {
        println!();
        println!("No workflow found. Run 'tickflow init' first.");
        println!();
        return Ok(None);
    }
    open_store(config).map(Some)
}
