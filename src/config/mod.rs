//! Configuration management for geobatch
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use geobatch::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Server listening on: {}", config.server.bind_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `GEOBATCH__<section>__<key>`
//!
//! Examples:
//! - `GEOBATCH__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `GEOBATCH__PLANNER__TARGET_CRS=EPSG:32633`
//! - `GEOBATCH__SERVER__MAX_PAYLOAD_BYTES=2MB`
//!
//! Secrets are only read from the environment: `S3_ACCESS_KEY` /
//! `AWS_ACCESS_KEY_ID`, `S3_SECRET_KEY` / `AWS_SECRET_ACCESS_KEY` and
//! `BATCH_CLIENT_SECRET`.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/geobatch.toml`.
//! This can be overridden using the `GEOBATCH_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    BatchConfig, CatalogConfig, Config, NotificationConfig, PlannerConfig, RegionsConfig,
    ServerConfig, StorageConfig, StorageProvider,
};
pub use validation::ValidationError;

use std::time::Duration;

use thiserror::Error;

use crate::http::HttpConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or
    /// validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path, without environment secrets
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

impl BatchConfig {
    /// Outbound client settings shared by the batch, catalog and
    /// notification adapters.
    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..HttpConfig::default()
        }
    }
}
