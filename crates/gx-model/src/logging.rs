//! Subscriber setup for binaries and tests embedding the runtime.
//!
//! The library itself only emits `tracing` events; nothing is printed unless
//! a subscriber is installed.

use std::path::PathBuf;

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that overrides `LogConfig::level`.
pub const LOG_ENV: &str = "GX_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line events.
    #[default]
    Compact,
    /// Multi-line, human-readable events.
    Pretty,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directive (e.g. "info", "gx_model=debug").
    pub level: String,
    /// Log file. Logs go to stderr when unset.
    pub output_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: "info".to_string(),
            output_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("failed to open log file: {0}")]
    FileOpen(String),
    #[error("subscriber already initialized")]
    AlreadyInitialized,
}

/// Resolve the filter directive, preferring `GX_LOG` when it is set.
fn filter_directive(config: &LogConfig) -> String {
    match std::env::var(LOG_ENV) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => config.level.clone(),
    }
}

/// Install a global `tracing` subscriber. Call once per process.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_new(filter_directive(config))
        .map_err(|e| LogError::InvalidFilter(e.to_string()))?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match (&config.output_path, config.format) {
        (Some(path), format) => {
            let file =
                std::fs::File::create(path).map_err(|e| LogError::FileOpen(e.to_string()))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file));
            match format {
                LogFormat::Compact => registry.with(layer.compact()).try_init(),
                LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
            }
        }
        (None, LogFormat::Compact) => registry.with(fmt::layer().compact()).try_init(),
        (None, LogFormat::Pretty) => registry.with(fmt::layer().pretty()).try_init(),
    };
    result.map_err(|_| LogError::AlreadyInitialized)
}
