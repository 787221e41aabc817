//! Error types for swarmguard.

use thiserror::Error;

/// Main error type for swarmguard operations.
#[derive(Error, Debug)]
pub enum SwarmGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cache/coordination backend is missing or failed a call
    #[error("Backend error: {0}")]
    Backend(String),

    /// Cluster membership or notification errors
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Audit sink failures
    #[error("Audit error: {0}")]
    Audit(String),

    /// JSON encoding errors for persisted records
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for swarmguard operations.
pub type Result<T> = std::result::Result<T, SwarmGuardError>;
