//! Error types for the task engine.

use std::path::PathBuf;

/// Top-level error type for the engine's own API.
///
/// Task body failures never show up here; they are absorbed into the task
/// record as `failed`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Task payload could not be serialized: {0}")]
    Payload(#[source] serde_json::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable snapshot errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Failed to write snapshot {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read snapshot {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to parse snapshot {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How a task body ended when it did not return normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
