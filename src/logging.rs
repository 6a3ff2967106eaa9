//! # Production Logging System
//!
//! Structured logging for the monitoring core: categorized events, env-filter
//! driven verbosity, optional JSON output and rolling file appenders. Every
//! service logs through the same helpers so operational tooling can filter by
//! category (ingest, detector, aggregation, ...) instead of grepping messages.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{MonitorError, Result};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Global logger instance with safe initialization
pub static LOGGER: Lazy<Arc<CoreLogger>> = Lazy::new(|| {
    match CoreLogger::with_config(LoggingConfig::default()) {
        Ok(logger) => Arc::new(logger),
        Err(_) => Arc::new(CoreLogger::new_minimal()),
    }
});

/// Log levels for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level - very detailed debugging
    Trace,
    /// Debug level - debugging information
    Debug,
    /// Info level - general information
    Info,
    /// Warning level - potentially harmful situations
    Warn,
    /// Error level - error events
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Log categories for structured logging
///
/// One category per subsystem so that an operator can raise or lower
/// verbosity for a single service through `RUST_LOG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogCategory {
    /// Pulse ingest and write buffer events
    Ingest,
    /// Status evaluation and group composition
    Status,
    /// Missing-pulse detector scans and transitions
    Detector,
    /// Notification dispatch and provider sends
    Notify,
    /// Hourly/daily aggregation runs
    Aggregation,
    /// Self-monitor probes and backfill
    Backfill,
    /// Configuration load and hot reload
    Config,
    /// Realtime broadcaster subscriptions
    Realtime,
    /// Storage backend interactions
    Storage,
    /// System startup, shutdown, lifecycle
    System,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogCategory::Ingest => write!(f, "ingest"),
            LogCategory::Status => write!(f, "status"),
            LogCategory::Detector => write!(f, "detector"),
            LogCategory::Notify => write!(f, "notify"),
            LogCategory::Aggregation => write!(f, "aggregation"),
            LogCategory::Backfill => write!(f, "backfill"),
            LogCategory::Config => write!(f, "config"),
            LogCategory::Realtime => write!(f, "realtime"),
            LogCategory::Storage => write!(f, "storage"),
            LogCategory::System => write!(f, "system"),
        }
    }
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRotation {
    /// No rotation
    Never,
    /// Rotate hourly
    Hourly,
    /// Rotate daily
    Daily,
}

/// Configuration for production logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum log level when `RUST_LOG` is unset
    pub min_level: LogLevel,
    /// Enable console output
    pub console_enabled: bool,
    /// Enable file logging
    pub file_enabled: bool,
    /// Log file directory
    pub log_dir: String,
    /// Log file rotation
    pub rotation: LogRotation,
    /// Enable structured JSON logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            console_enabled: true,
            file_enabled: false,
            log_dir: "./logs".to_string(),
            rotation: LogRotation::Daily,
            json_format: false,
        }
    }
}

/// Logging front-end owning subscriber initialization
///
/// Construction is idempotent: the first instance installs the global tracing
/// subscriber, later instances (tests create several) reuse it.
pub struct CoreLogger {
    /// Configuration
    config: LoggingConfig,
}

impl CoreLogger {
    /// Create new logger with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(LoggingConfig::default())
    }

    /// Create a minimal logger that doesn't initialize tracing (for fallback)
    pub fn new_minimal() -> Self {
        Self {
            config: LoggingConfig {
                console_enabled: false,
                file_enabled: false,
                ..LoggingConfig::default()
            },
        }
    }

    /// Create logger with custom configuration
    pub fn with_config(config: LoggingConfig) -> Result<Self> {
        if config.file_enabled {
            fs::create_dir_all(&config.log_dir).map_err(|e| {
                MonitorError::ConfigInvalid(format!("Failed to create log directory: {e}"))
            })?;
        }

        Self::init_tracing(&config)?;

        Ok(Self { config })
    }

    /// Initialize tracing subscriber (thread-safe, can be called multiple times)
    fn init_tracing(config: &LoggingConfig) -> Result<()> {
        if TRACING_INITIALIZED
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // Tracing already initialized, return success
            return Ok(());
        }

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Self::level_to_string(config.min_level)));

        let mut layers = Vec::new();

        // Console layer
        if config.console_enabled {
            let console_layer = fmt::layer().with_target(true);

            if config.json_format {
                layers.push(console_layer.json().boxed());
            } else {
                layers.push(console_layer.boxed());
            }
        }

        // File layer
        if config.file_enabled {
            let file_appender = match config.rotation {
                LogRotation::Daily => rolling::daily(&config.log_dir, "pulse-sentinel.log"),
                LogRotation::Hourly => rolling::hourly(&config.log_dir, "pulse-sentinel.log"),
                LogRotation::Never => rolling::never(&config.log_dir, "pulse-sentinel.log"),
            };

            let (non_blocking, _guard) = non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            if config.json_format {
                layers.push(file_layer.json().boxed());
            } else {
                layers.push(file_layer.boxed());
            }
        }

        match tracing_subscriber::registry()
            .with(env_filter)
            .with(layers)
            .try_init()
        {
            Ok(()) => Ok(()),
            Err(_) => {
                // Another subscriber won the race (common under test harnesses)
                TRACING_INITIALIZED.store(false, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Convert log level to env-filter string
    fn level_to_string(level: LogLevel) -> &'static str {
        match level {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Current configuration
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

/// Global logging functions
pub fn log_info(category: LogCategory, message: &str) {
    Lazy::force(&LOGGER);
    info!(category = %category, "{message}");
}

pub fn log_warn(category: LogCategory, message: &str) {
    Lazy::force(&LOGGER);
    warn!(category = %category, "{message}");
}

pub fn log_error(category: LogCategory, message: &str) {
    Lazy::force(&LOGGER);
    error!(category = %category, "{message}");
}

pub fn log_debug(category: LogCategory, message: &str) {
    Lazy::force(&LOGGER);
    debug!(category = %category, "{message}");
}
