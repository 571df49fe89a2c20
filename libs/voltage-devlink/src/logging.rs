//! Logging setup for the device link binary and embedding services

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{DevLinkError, Result};

/// Console/file output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
    Compact,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive (`info`, `voltage_devlink=debug,warn`, ...)
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
    /// Log file path, rotated daily
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            console: true,
            file: None,
            format: LogFormat::Pretty,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Build the filter; an invalid directive falls back to `info`
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize the global subscriber.
///
/// Returns a guard that must be kept alive for file logging to work.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers = Vec::new();
    let mut guard = None;

    if config.console {
        let console_layer = match config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_ansi(config.ansi)
                .with_target(true)
                .with_thread_ids(true)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_ansi(config.ansi)
                .with_target(true)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_ansi(config.ansi)
                .with_target(true)
                .boxed(),
        };
        layers.push(console_layer.with_filter(config.env_filter()).boxed());
    }

    if let Some(file_path) = &config.file {
        let path = Path::new(file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("devlink.log");
        let file_appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let file_layer = match config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
            LogFormat::Pretty | LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        };
        layers.push(file_layer.with_filter(config.env_filter()).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| DevLinkError::config(format!("Failed to initialize logging: {e}")))?;

    Ok(guard)
}
