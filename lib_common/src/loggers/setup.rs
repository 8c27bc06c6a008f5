//! # Setup Logging
//!
//! Configures the global `tracing` subscriber.
//!
//! Logging is set up to:
//! - Read the filter from the `RUST_LOG` environment variable, falling back to
//!   the configured level.
//! - Write logs to both standard output and a daily rotating file.
//! - Console logs are human-readable with ANSI color support.
//! - File logs are JSON-formatted for structured analysis.

use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// # Setup Logging
///
/// Installs the console and file layers and returns the [`WorkerGuard`] of the
/// non-blocking file writer. The caller must keep the guard alive for the
/// lifetime of the process, otherwise buffered lines are lost on exit.
///
/// # Arguments
/// * `log_dir` - Directory for the rotating log files. Created if missing.
/// * `log_level` - Default filter directive used when `RUST_LOG` is unset.
/// * `app_name` - File name prefix of the rotating log files.
///
/// # Errors
/// Fails when the log directory cannot be created, the filter directive is
/// invalid, or a global subscriber is already installed.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, app_name);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    info!(app = app_name, dir = %log_dir.display(), "Logging initialized with level: {}", log_level);
    Ok(guard)
}
