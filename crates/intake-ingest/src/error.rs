//! Ingestion error taxonomy
//!
//! Schema, source, task and configuration errors end a file's job. Batch
//! flush, worker and notification errors are isolated where they happen and
//! surface as log events and reduced counts.

use thiserror::Error;

use crate::storage::ObjectLocation;

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Header is missing one or more required columns
    #[error("Missing required column(s): {}", missing.join(", "))]
    Schema { missing: Vec<String> },

    /// The object could not be opened
    #[error("Failed to open {location}: {message}")]
    SourceConnect {
        location: ObjectLocation,
        message: String,
    },

    /// The object stream failed part way through
    #[error("Failed to read {location} at line {line}: {message}")]
    SourceRead {
        location: ObjectLocation,
        line: u64,
        message: String,
    },

    /// A parser worker failed for reasons unrelated to row content
    #[error("Parser worker {worker} failed: {message}")]
    WorkerFatal { worker: usize, message: String },

    /// A bulk upsert transaction was not committed
    #[error("Failed to flush batch of {batch_size} records: {source}")]
    BatchFlush {
        batch_size: usize,
        #[source]
        source: Box<IngestError>,
    },

    /// The reader or writer task ended without reporting a result
    #[error("{task} task failed: {message}")]
    Task { task: &'static str, message: String },

    #[error("Completion notification failed: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Whether the error aborts the job for the current file
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Schema { .. }
                | IngestError::SourceConnect { .. }
                | IngestError::SourceRead { .. }
                | IngestError::Task { .. }
                | IngestError::Config(_)
        )
    }

    pub fn source_connect(location: &ObjectLocation, message: impl ToString) -> Self {
        Self::SourceConnect {
            location: location.clone(),
            message: message.to_string(),
        }
    }

    pub fn batch_flush(batch_size: usize, source: IngestError) -> Self {
        Self::BatchFlush {
            batch_size,
            source: Box::new(source),
        }
    }
}

/// Why a row produced no record. Discards are counted and logged, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// The column exists but its value did not parse
    InvalidField(&'static str),
    /// The row is shorter than the column the field maps to
    MissingField(&'static str),
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::InvalidField(name) => write!(f, "invalid value for {}", name),
            DiscardReason::MissingField(name) => write!(f, "no value for {}", name),
        }
    }
}
