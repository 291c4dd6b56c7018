//! Configuration for tickflow.
//!
//! Settings are read from `.tickflow/tickflow.toml` (defaults when the file
//! is missing), then overridden by environment variables (a `.env` file in
//! the project directory is loaded first), then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! path = ".tickflow/state.db"
//!
//! [scheduler]
//! max_conflict_retries = 8
//! poll_interval_ms = 500
//!
//! [queue]
//! default_policy = "immediate"
//! poll_interval_ms = 250
//!
//! [queue.policies]
//! vcs = "batched"
//!
//! [lock]
//! backoff_secs = 300
//! stale_after_secs = 900
//! heartbeat_secs = 60
//! max_attempts = 10
//! ```

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".tickflow";
pub const CONFIG_FILE: &str = "tickflow.toml";
pub const DB_ENV: &str = "TICKFLOW_DB";
pub const HOLDER_ENV: &str = "TICKFLOW_HOLDER_ID";

/// How a resource-class worker picks up newly enqueued operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// Each enqueue wakes the worker right away.
    #[default]
    Immediate,
    /// Operations wait for the next scheduler tick boundary and are drained
    /// together, in order.
    Batched,
}

impl std::fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchPolicy::Immediate => write!(f, "immediate"),
            DispatchPolicy::Batched => write!(f, "batched"),
        }
    }
}

impl std::str::FromStr for DispatchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" => Ok(DispatchPolicy::Immediate),
            "batched" => Ok(DispatchPolicy::Batched),
            _ => anyhow::bail!(
                "Invalid dispatch policy '{}'. Valid values: immediate, batched",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    /// Database path, relative to the project directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Re-read/retry budget for one tick when CAS writes keep losing races
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    /// Fallback re-evaluation interval, also used to pick up other processes' writes
    #[serde(default = "default_scheduler_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_conflict_retries() -> u32 {
    8
}

fn default_scheduler_poll_ms() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
            poll_interval_ms: default_scheduler_poll_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub default_policy: DispatchPolicy,
    #[serde(default = "default_queue_poll_ms")]
    pub poll_interval_ms: u64,
    /// Per resource-class overrides
    #[serde(default)]
    pub policies: HashMap<String, DispatchPolicy>,
}

fn default_queue_poll_ms() -> u64 {
    250
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_policy: DispatchPolicy::default(),
            poll_interval_ms: default_queue_poll_ms(),
            policies: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn policy_for(&self, kind: &str) -> DispatchPolicy {
        self.policies
            .get(kind)
            .copied()
            .unwrap_or(self.default_policy)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn with_policy(mut self, kind: &str, policy: DispatchPolicy) -> Self {
        self.policies.insert(kind.to_string(), policy);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Wait before a losing process retries its triggering action
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    /// Heartbeat age after which a claim may be force-reclaimed
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Trigger attempts before the remediation protocol gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_backoff_secs() -> u64 {
    5 * 60
}

fn default_stale_after_secs() -> u64 {
    15 * 60
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backoff_secs: default_backoff_secs(),
            stale_after_secs: default_stale_after_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl LockConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stale_after(&self) -> TimeDelta {
        TimeDelta::seconds(self.stale_after_secs as i64)
    }
}

/// The complete tickflow.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickflowToml {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

impl TickflowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tickflow.toml")
    }

    /// Load from `<config_dir>/tickflow.toml`, or defaults if it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize tickflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.lock.heartbeat_secs >= self.lock.stale_after_secs {
            warnings.push(format!(
                "lock.heartbeat_secs ({}) should be well below lock.stale_after_secs ({}); live holders will look stale",
                self.lock.heartbeat_secs, self.lock.stale_after_secs
            ));
        }
        if self.lock.max_attempts == 0 {
            warnings.push("lock.max_attempts is 0; triggers will never run".to_string());
        }
        if self.scheduler.poll_interval_ms == 0 {
            warnings.push("scheduler.poll_interval_ms is 0; the tick loop will spin".to_string());
        }
        if self.queue.poll_interval_ms == 0 {
            warnings.push("queue.poll_interval_ms is 0; workers will spin".to_string());
        }
        warnings
    }
}

/// Resolved configuration: file, environment and CLI layers combined.
#[derive(Debug, Clone)]
pub struct TickflowConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: TickflowToml,
    /// CLI override for the database path
    pub cli_db: Option<PathBuf>,
    /// CLI override for the holder id used in lock claims
    pub cli_holder: Option<String>,
}

impl TickflowConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        // Missing .env is the common case.
        let _ = dotenvy::from_path(project_dir.join(".env"));
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = TickflowToml::load_or_default(&config_dir)?;
        Ok(Self {
            project_dir,
            config_dir,
            toml,
            cli_db: None,
            cli_holder: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        db: Option<PathBuf>,
        holder: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_db = db;
        config.cli_holder = holder;
        Ok(config)
    }

    /// Database path (CLI → env → file → default).
    pub fn db_path(&self) -> PathBuf {
        let path = self
            .cli_db
            .clone()
            .or_else(|| std::env::var(DB_ENV).ok().map(PathBuf::from))
            .or_else(|| self.toml.store.path.clone())
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("state.db"));
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }

    /// Identity used when claiming locks and worker leases (CLI → env → generated).
    pub fn holder_id(&self) -> String {
        self.cli_holder
            .clone()
            .or_else(|| std::env::var(HOLDER_ENV).ok())
            .unwrap_or_else(generate_holder_id)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// `pid-<pid>-<8 hex chars>`: unique per process start.
pub fn generate_holder_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("pid-{}-{}", std::process::id(), &suffix[..8])
}
