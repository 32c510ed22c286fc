//! Error types for fuzz-scheduler operations.
//!
//! Subsystem errors that belong to a single module live next to it
//! (`DatabaseError`, `MigrationError`, `TransportError`, `PackageError`).
//! This module holds the ones shared across modules:
//! - Configuration loading and validation
//! - Scheduler components and the controller loop

use thiserror::Error;

use crate::storage::DatabaseError;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the scheduling components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
