//! Logging configuration module
//! Console output plus an optional rolling JSON file

use serde::{Deserialize, Serialize};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "kubepatrol.log";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Directory for rolling log files; console only when unset
    pub file_path: Option<String>,
    pub rotation: LogRotation,
    /// Emit console output as JSON
    pub json_format: bool,
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            rotation: LogRotation::Daily,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Build the env filter; `RUST_LOG` wins over the configured level
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Initialize the global subscriber.
    ///
    /// The returned guard flushes the file writer and must be held for the
    /// lifetime of the process.
    pub fn init(&self) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
        let env_filter = self.env_filter();

        let console_layer = if self.json_format {
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .json()
                .with_writer(io::stdout)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_ansi(true)
                .with_writer(io::stdout)
                .boxed()
        };

        let guard = if let Some(ref path) = self.file_path {
            let file_appender = match self.rotation {
                LogRotation::Hourly => rolling::hourly(path, LOG_FILE_PREFIX),
                LogRotation::Daily => rolling::daily(path, LOG_FILE_PREFIX),
                LogRotation::Never => rolling::never(path, LOG_FILE_PREFIX),
            };

            let (non_blocking, guard) = non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()?;
            Some(guard)
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()?;
            None
        };

        tracing::info!("Logging initialized - level: {}", self.level);

        Ok(guard)
    }
}
