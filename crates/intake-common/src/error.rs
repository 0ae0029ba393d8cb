//! Error types shared across intake binaries

use thiserror::Error;

/// Result type alias for intake operations
pub type Result<T> = std::result::Result<T, IntakeError>;

/// Errors that are not specific to the ingestion pipeline
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl IntakeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
