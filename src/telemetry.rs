//! Tracing subscriber setup.
//!
//! Human-readable or JSON events go to stderr so command output on stdout
//! stays clean. When a log directory is given, the same events are also
//! appended to a daily-rolling file through a non-blocking writer; keep the
//! returned guard alive until exit so buffered lines are flushed.

use std::path::Path;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Overrides the default filter, e.g. `TICKFLOW_LOG=tickflow::store=trace`.
pub const LOG_ENV: &str = "TICKFLOW_LOG";
const LOG_FILE_PREFIX: &str = "tickflow.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "tickflow=debug"
    } else {
        "tickflow=info"
    }
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber. Does nothing (and returns `None`) if one
/// is already installed.
pub fn init(verbose: bool, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let text = (format == LogFormat::Text).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let json = (format == LogFormat::Json).then(|| fmt::layer().json().with_writer(std::io::stderr));

    let installed = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(text)
        .with(json)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed { guard } else { None }
}
