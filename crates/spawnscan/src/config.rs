//! Configuration file loading
//!
//! One file drives the whole binary: the scan configuration (users, work,
//! `scanner` settings) at the top level, plus optional `gateway`, `output`
//! and `logging` sections.

use scan_core::{ConfigurationError, ScanConfiguration};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::cli::Args;

fn default_endpoint() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("output")
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigurationError),

    #[error("invalid log level '{0}' (expected one of trace, debug, info, warn, error)")]
    LogLevel(String),
}

/// Connection to the map gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

/// Application configuration loaded from a JSON or TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub scan: ScanConfiguration,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Loads the configuration file at `path`.
    ///
    /// Files ending in `.toml` are parsed as TOML, everything else as JSON.
    /// The result is not validated yet; see [`AppConfig::validate`].
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigLoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let config = if is_toml {
            toml::from_str(&content).map_err(|source| ConfigLoadError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            serde_json::from_str(&content).map_err(|source| ConfigLoadError::Json {
                path: path.to_path_buf(),
                source,
            })?
        };

        info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    /// Applies command-line overrides on top of the file settings.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(radius) = args.radius {
            self.scan.scanner.radius = radius;
        }
        if let Some(error) = args.error {
            self.scan.scanner.error_margin = error;
        }
        if let Some(passes) = args.passes {
            self.scan.scanner.pass_count = passes;
        }
        if let Some(output) = &args.output {
            self.output.directory = output.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigLoadError::LogLevel(self.logging.level.clone()));
        }
        if self.gateway.request_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidSetting("request_timeout_ms must be positive".to_string()).into());
        }
        self.scan.validate()?;
        Ok(())
    }
}
