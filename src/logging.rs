//! Logging setup for binaries built on the SDK.
//!
//! The library itself only emits `tracing` events. Targets follow the module
//! path, so components can be filtered individually:
//!
//! ```bash
//! # Debug the store, info for everything else
//! RUST_LOG=info,zero_rust_sdk::store=debug cargo run --bin zero_monitor
//!
//! # Trace every eth_call
//! RUST_LOG=zero_rust_sdk::remote=trace cargo run --bin zero_monitor
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry,
};

use crate::{prelude::*, Error};

const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,tokio_tungstenite=warn";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable format with colors (default for development)
    #[default]
    Pretty,
    /// JSON format (best for log aggregation)
    Json,
    /// Compact single-line format
    Compact,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogConfig {
    /// Directory for rolling log files. No files are written when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Level for the full log file
    #[serde(default = "default_file_level")]
    pub file_level: String,

    /// Level for the separate error log file
    #[serde(default = "default_error_level")]
    pub error_level: String,

    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,

    #[serde(default)]
    pub stdout_format: LogFormat,
}

fn default_file_level() -> String {
    "debug".to_string()
}

fn default_error_level() -> String {
    "warn".to_string()
}

fn default_enable_stdout() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_level: default_file_level(),
            error_level: default_error_level(),
            enable_stdout: default_enable_stdout(),
            stdout_format: LogFormat::default(),
        }
    }
}

impl LogConfig {
    /// Pretty stdout, no files.
    pub fn development() -> Self {
        Self::default()
    }

    /// JSON stdout plus daily rotated files in `log_dir`.
    pub fn production(log_dir: PathBuf) -> Self {
        Self {
            log_dir: Some(log_dir),
            stdout_format: LogFormat::Json,
            ..Default::default()
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn file_layer(dir: &Path, file_name: &str, level: &str, guards: &mut Vec<WorkerGuard>) -> BoxedLayer {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    guards.push(guard);

    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .json()
        .with_filter(EnvFilter::new(level))
        .boxed()
}

/// Install the global subscriber.
///
/// `RUST_LOG` (or `env_filter_override`) controls stdout. The returned
/// guards flush the file writers and must outlive the program's logging.
pub fn init_logging(config: &LogConfig, env_filter_override: Option<&str>) -> Result<Vec<WorkerGuard>> {
    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let stdout_filter = match env_filter_override {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    if config.enable_stdout {
        let layer = match config.stdout_format {
            LogFormat::Json => fmt::layer().json().with_filter(stdout_filter).boxed(),
            LogFormat::Compact => fmt::layer().compact().with_filter(stdout_filter).boxed(),
            LogFormat::Pretty => fmt::layer().with_target(false).with_filter(stdout_filter).boxed(),
        };
        layers.push(layer);
    }

    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("cannot create log dir {}: {e}", dir.display())))?;
        layers.push(file_layer(dir, "zero.log", &config.file_level, &mut guards));
        layers.push(file_layer(dir, "zero-errors.log", &config.error_level, &mut guards));
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialised: {e}")))?;

    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert!(config.log_dir.is_none());
        assert!(config.enable_stdout);
        assert_eq!(config.stdout_format, LogFormat::Pretty);
        assert_eq!(config.file_level, "debug");
    }

    #[test]
    fn test_log_config_production() {
        let config = LogConfig::production(PathBuf::from("/var/log/zero"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/zero")));
        assert_eq!(config.stdout_format, LogFormat::Json);
    }

    #[test]
    fn test_log_format_serde() {
        let json = serde_json::to_string(&LogFormat::Json).unwrap();
        assert_eq!(json, "\"json\"");

        let parsed: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(parsed, LogFormat::Compact);
    }
}
