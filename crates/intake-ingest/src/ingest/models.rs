//! Records and reports flowing through the pipeline

use csv_async::StringRecord;
use serde::Serialize;
use sqlx::types::BigDecimal;
use std::time::Duration;

/// One validated input row, keyed by `subject_id`
///
/// Only the record parser constructs these, and only when every field parsed.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SubjectRecord {
    pub subject_id: String,
    pub email: String,
    pub monthly_income: BigDecimal,
    pub credit_score: i32,
    pub employment_status: String,
    pub age: i32,
}

/// One raw row as tokenized from the stream
#[derive(Debug, Clone)]
pub struct Row {
    /// 1-based line number in the source, the header being line 1
    pub line: u64,
    pub fields: StringRecord,
}

/// Counters one parser worker returns when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub records_parsed: u64,
    pub rows_discarded: u64,
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.records_parsed += other.records_parsed;
        self.rows_discarded += other.rows_discarded;
    }
}

/// Counters the batch writer returns once the record queue is drained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Sum of the sizes of committed batches
    pub records_persisted: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    /// Records lost with failed batches
    pub records_dropped: u64,
}

/// Terminal output of one file's ingestion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionReport {
    pub records_persisted: u64,
    /// Data rows handed to the parser workers, excluding the header
    pub rows_read: u64,
    /// Rows the tokenizer could not split
    pub rows_malformed: u64,
    /// Rows that tokenized but failed validation
    pub rows_discarded: u64,
    pub records_parsed: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    /// Parsed records lost with failed batches
    pub records_dropped: u64,
    pub worker_errors: u64,
    /// Reading stopped early because the job was cancelled
    pub cancelled: bool,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
