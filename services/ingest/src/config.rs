//! Configuration management for the ingest service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use ndt_pipeline::{KafkaConfig, S3Config};
use serde::Deserialize;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Image normalization configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Object store configuration
    #[serde(default)]
    pub s3: S3Config,

    /// Broker configuration
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins (empty = allow all)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Enable Prometheus metrics export
    #[serde(default)]
    pub enable_metrics: bool,

    /// Port for the Prometheus exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Image normalization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Canonical width of stored images
    #[serde(default = "default_target_width")]
    pub target_width: u32,

    /// Canonical height of stored images
    #[serde(default = "default_target_height")]
    pub target_height: u32,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_target_width() -> u32 {
    640
}
fn default_target_height() -> u32 {
    640
}
fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            enable_metrics: false,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            target_width: default_target_width(),
            target_height: default_target_height(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/ingest.toml)
    /// 2. System config (/etc/ndt/ingest.toml)
    /// 3. Environment variables (prefixed with INGEST__)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name("/etc/ndt/ingest").required(false))
            // e.g. INGEST__S3__BUCKET
            .add_source(
                Environment::with_prefix("INGEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.processing.target_width == 0 || self.processing.target_height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.target_width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if self.processing.max_upload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.max_upload_bytes".to_string(),
                message: "Upload limit must be greater than 0".to_string(),
            });
        }

        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        self.kafka
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "kafka".to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
