use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tickflow::config::TickflowConfig;
use tickflow::store::OperationStatus;
use tickflow::telemetry::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "tickflow")]
#[command(version, about = "Durable phase/step workflow engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Database path. Overrides TICKFLOW_DB and tickflow.toml.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Holder id used for lock claims. Overrides TICKFLOW_HOLDER_ID.
    #[arg(long, global = true)]
    pub holder: Option<String>,

    /// Log output format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the workflow rows for a shape (safe to re-run)
    Init {
        /// JSON shape file: {"phases": [{"steps": 2}, ...]}
        #[arg(long, conflicts_with_all = ["phases", "steps"])]
        shape: Option<PathBuf>,
        /// Number of phases (with --steps)
        #[arg(long, requires = "steps")]
        phases: Option<u32>,
        /// Steps per phase (with --phases)
        #[arg(long, requires = "phases")]
        steps: Option<u32>,
    },
    /// Show phase, step and task progress
    Status {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one scheduler pass against the stored state
    Tick,
    /// List queued operations
    Ops {
        /// Only this resource-class
        #[arg(short, long)]
        kind: Option<String>,
        /// pending, running, done or failed
        #[arg(short, long)]
        status: Option<OperationStatus>,
    },
    /// Append an operation to a resource-class queue
    Enqueue {
        kind: String,
        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,
    },
    /// Re-enqueue a failed operation as a new pending one
    Retry { id: i64 },
    /// Inspect or override a singleton lock
    Lock {
        resource: String,
        /// Persist Claimed -> Stale if the holder's heartbeat expired
        #[arg(long, conflicts_with = "force_release")]
        mark_stale: bool,
        /// Return the lock to Idle regardless of holder
        #[arg(long)]
        force_release: bool,
    },
    /// Show the transition log
    Log {
        /// Only entries after this sequence number
        #[arg(long, default_value = "0")]
        since: i64,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default tickflow.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = TickflowConfig::with_cli_args(project_dir, cli.db.clone(), cli.holder.clone())?;
    let log_dir = config.config_dir.exists().then(|| config.log_dir());
    let _log_guard = telemetry::init(cli.verbose, cli.log_format, log_dir.as_deref());

    match &cli.command {
        Commands::Init {
            shape,
            phases,
            steps,
        } => cmd::cmd_init(&config, shape.as_deref(), *phases, *steps)?,
        Commands::Status { json } => cmd::cmd_status(&config, *json)?,
        Commands::Tick => cmd::cmd_tick(&config)?,
        Commands::Ops { kind, status } => cmd::cmd_ops(&config, kind.as_deref(), *status)?,
        Commands::Enqueue { kind, payload } => cmd::cmd_enqueue(&config, kind, payload)?,
        Commands::Retry { id } => cmd::cmd_retry(&config, *id)?,
        Commands::Lock {
            resource,
            mark_stale,
            force_release,
        } => cmd::cmd_lock(&config, resource, *mark_stale, *force_release)?,
        Commands::Log { since, limit } => cmd::cmd_log(&config, *since, *limit)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
