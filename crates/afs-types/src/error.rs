//! Error types shared across the application file system crates.

use thiserror::Error;

/// Error type for domain-level validation and configuration.
#[derive(Debug, Error)]
pub enum AfsError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
