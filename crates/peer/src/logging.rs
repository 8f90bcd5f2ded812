//! Log output: stderr plus a daily rolling file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// File name prefix of the rolling log.
pub const LOG_FILE_NAME: &str = "dashdrop.log";

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then the configured level.
pub fn build_filter(level: &str, verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { level };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held
/// until the process exits.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<WorkerGuard> {
    let (writer, guard) = open_log_writer(&config.directory)?;

    tracing_subscriber::registry()
        .with(build_filter(&config.level, verbose))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn open_log_writer(directory: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

    let appender = tracing_appender::rolling::daily(directory, LOG_FILE_NAME);
    Ok(tracing_appender::non_blocking(appender))
}
