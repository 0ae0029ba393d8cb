//! Batch writer
//!
//! The single consumer of the record queue. Records accumulate in one batch
//! that is upserted when it reaches the configured size, plus a final flush
//! of whatever remains once the queue closes. Each flush is an independent
//! transaction: a failed batch is logged and dropped, and the job carries on.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::models::{SubjectRecord, WriterStats};
use crate::error::{IngestError, IngestResult};

/// Destination for validated records
#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Insert or overwrite `records` by `subject_id`, atomically
    ///
    /// Either every record in the slice is committed or none is.
    async fn upsert_batch(&self, records: &[SubjectRecord]) -> IngestResult<()>;
}

#[async_trait]
impl<S: SubjectStore + ?Sized> SubjectStore for Arc<S> {
    async fn upsert_batch(&self, records: &[SubjectRecord]) -> IngestResult<()> {
        (**self).upsert_batch(records).await
    }
}

pub struct BatchWriter<S> {
    store: S,
    batch: Vec<SubjectRecord>,
    batch_size: usize,
    stats: WriterStats,
}

impl<S: SubjectStore> BatchWriter<S> {
    pub fn new(store: S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            store,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            stats: WriterStats::default(),
        }
    }

    /// Drain `records` until every sender is gone, then flush the remainder
    pub async fn consume(mut self, mut records: mpsc::Receiver<SubjectRecord>) -> WriterStats {
        while let Some(record) = records.recv().await {
            self.batch.push(record);
            if self.batch.len() >= self.batch_size {
                self.flush().await;
            }
        }

        self.flush().await;

        debug!(
            records_persisted = self.stats.records_persisted,
            batches_committed = self.stats.batches_committed,
            batches_failed = self.stats.batches_failed,
            "Record queue drained"
        );

        self.stats
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let size = self.batch.len();
        match self.store.upsert_batch(&self.batch).await {
            Ok(()) => {
                self.stats.records_persisted += size as u64;
                self.stats.batches_committed += 1;
                debug!(batch_size = size, "Batch committed");
            },
            Err(e) => {
                let err = IngestError::batch_flush(size, e);
                self.stats.batches_failed += 1;
                self.stats.records_dropped += size as u64;
                error!(batch_size = size, error = %err, "Dropping batch after failed upsert");
            },
        }

        self.batch.clear();
    }
}
