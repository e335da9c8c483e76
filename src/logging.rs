#![forbid(unsafe_code)]

//! Tracing setup for the backend binary.
//!
//! Console output is always on. When a log directory is configured a daily
//! rolling file sink is added; if it cannot be created the service keeps
//! running with console logging only.

use std::{fs, path::PathBuf};

use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_FILE_PREFIX: &str = "tubefetch";
pub const LOG_FILE_SUFFIX: &str = "log";
pub const LOG_RETENTION_FILES: usize = 14;

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Explicit filter from the command line. Wins over `RUST_LOG`.
    pub cli_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub log_dir: Option<PathBuf>,
}

/// Keeps the file writer flushing. Drop it only at process exit.
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
    pub file_sink_error: Option<String>,
}

pub fn select_filter(options: &LoggingOptions) -> String {
    options
        .cli_filter
        .as_deref()
        .or(options.rust_log_env.as_deref())
        .map(str::trim)
        .filter(|filter| !filter.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER)
        .to_string()
}

fn build_appender(options: &LoggingOptions) -> Result<Option<RollingFileAppender>, String> {
    let Some(dir) = options.log_dir.as_deref() else {
        return Ok(None);
    };
    fs::create_dir_all(dir)
        .map_err(|err| format!("failed to create log directory {}: {err}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(dir)
        .map(Some)
        .map_err(|err| format!("failed to initialize rolling file sink: {err}"))
}

/// Installs the global subscriber. Calling it twice is an error reported by
/// `tracing_subscriber`, so the binary calls it once from `main`.
pub fn init(options: &LoggingOptions) -> anyhow::Result<LoggingGuard> {
    let filter = select_filter(options);
    let (file_layer, guard, file_sink_error) = match build_appender(options) {
        Ok(Some(appender)) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard), None)
        }
        Ok(None) => (None, None, None),
        Err(reason) => (None, None, Some(reason)),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()?;

    if let Some(reason) = &file_sink_error {
        tracing::warn!("file logging disabled: {reason}");
    }
    Ok(LoggingGuard {
        _file: guard,
        file_sink_error,
    })
}
