//! Tracing setup for the capture binary: stderr plus an optional
//! daily-rolling file under `logging.log_dir`.

use crate::config::LoggingSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_FILE_PREFIX: &str = "cinepi-capture.log";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to create log directory: {0}")]
    Directory(#[from] std::io::Error),

    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level; `verbose` forces `debug`.
///
/// The returned guard flushes the file writer on drop and must be held
/// for the life of the process.
pub fn init_logging(settings: &LoggingSettings, verbose: bool) -> Result<Option<WorkerGuard>, LogError> {
    let level = if verbose { "debug" } else { settings.log_level.as_str() };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if !settings.file_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init()?;
        return Ok(None);
    }

    std::fs::create_dir_all(&settings.log_dir)?;
    let appender = tracing_appender::rolling::daily(&settings.log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(log_dir = %settings.log_dir.display(), level, "Logging initialized");
    Ok(Some(guard))
}
