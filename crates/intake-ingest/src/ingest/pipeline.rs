//! Streaming ingestion pipeline
//!
//! One file flows through four stages connected by bounded queues:
//!
//! ```text
//! reader ──rows──▶ W parser workers ──records──▶ batch writer ──▶ store
//! ```
//!
//! The reader resolves the header before any worker starts, so a schema
//! error never writes anything. Both queues are bounded, which keeps memory
//! flat regardless of file size: a slow store stalls the writer, which fills
//! the record queue, which stalls the workers, which stalls the reader.
//!
//! Shutdown cascades through channel closure. The reader drops the row
//! sender at end of stream; each worker exits once the row queue is drained
//! and drops its record sender; the record queue closes when the last worker
//! is gone, and the writer performs its final flush.

use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use super::columns::ColumnMapping;
use super::models::{IngestionReport, Row, SubjectRecord, WorkerStats};
use super::parser::parse_record;
use super::writer::{BatchWriter, SubjectStore};
use crate::config::PipelineConfig;
use crate::error::{IngestError, IngestResult};
use crate::storage::{ObjectLocation, ObjectReader, ObjectSource};

/// Counters kept by the reader
#[derive(Debug, Default, Clone, Copy)]
struct ReaderStats {
    rows_read: u64,
    rows_malformed: u64,
    cancelled: bool,
}

type SharedRows = Arc<Mutex<mpsc::Receiver<Row>>>;

pub struct IngestionPipeline {
    source: Arc<dyn ObjectSource>,
    store: Arc<dyn SubjectStore>,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn ObjectSource>,
        store: Arc<dyn SubjectStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// Ingest one object end to end
    ///
    /// Returns once every accepted record has been flushed or dropped with a
    /// failed batch. Cancelling `cancel` stops the reader; rows already
    /// queued are still parsed and written.
    #[instrument(
        skip_all,
        fields(job_id = %Uuid::new_v4(), bucket = %location.bucket, key = %location.key)
    )]
    pub async fn run(
        &self,
        location: &ObjectLocation,
        cancel: CancellationToken,
    ) -> IngestResult<IngestionReport> {
        let started = Instant::now();
        let workers = self.config.workers.max(1);
        let capacity = self.config.queue_capacity.max(1);

        let stream = self.source.open(location).await?;
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(false)
            .buffer_capacity(self.config.read_buffer_bytes.max(1))
            .create_reader(stream);

        let mapping = Arc::new(read_header(&mut reader, location).await?);
        debug!(columns = mapping.column_count(), "Header resolved");

        // A timeout only stops this file, never the caller's other work
        let cancel = cancel.child_token();
        let deadline = self.config.timeout.map(|limit| {
            let token = cancel.clone();
            tokio::spawn(
                async move {
                    tokio::select! {
                        _ = tokio::time::sleep(limit) => {
                            warn!(timeout_secs = limit.as_secs(), "Ingestion timed out, stopping reader");
                            token.cancel();
                        }
                        _ = token.cancelled() => {}
                    }
                }
                .in_current_span(),
            )
        });

        let (row_tx, row_rx) = mpsc::channel::<Row>(capacity);
        let (record_tx, record_rx) = mpsc::channel::<SubjectRecord>(capacity);
        let (error_tx, mut error_rx) = mpsc::channel::<IngestError>(workers);

        let writer = tokio::spawn(
            BatchWriter::new(self.store.clone(), self.config.batch_size)
                .consume(record_rx)
                .in_current_span(),
        );

        let rows: SharedRows = Arc::new(Mutex::new(row_rx));
        let handles: Vec<JoinHandle<IngestResult<WorkerStats>>> = (0..workers)
            .map(|id| {
                tokio::spawn(
                    parse_worker(id, rows.clone(), record_tx.clone(), mapping.clone())
                        .in_current_span(),
                )
            })
            .collect();
        // Only the workers hold record senders now
        drop(record_tx);

        let supervisor = tokio::spawn(supervise(handles, error_tx).in_current_span());

        let reader_task = tokio::spawn(
            read_rows(reader, location.clone(), row_tx, cancel.clone()).in_current_span(),
        );

        let reader_result = reader_task.await.unwrap_or_else(|e| {
            Err(IngestError::Task {
                task: "reader",
                message: e.to_string(),
            })
        });

        let worker_stats = supervisor.await.unwrap_or_else(|e| {
            error!(error = %e, "Worker supervisor failed");
            WorkerStats::default()
        });

        let mut worker_errors = 0u64;
        while let Some(err) = error_rx.recv().await {
            worker_errors += 1;
            error!(error = %err, "Parser worker failed");
        }

        let writer_result = writer.await;

        if let Some(deadline) = deadline {
            deadline.abort();
        }

        let reader_stats = reader_result?;
        let writer_stats = writer_result.map_err(|e| IngestError::Task {
            task: "writer",
            message: e.to_string(),
        })?;

        let report = IngestionReport {
            records_persisted: writer_stats.records_persisted,
            rows_read: reader_stats.rows_read,
            rows_malformed: reader_stats.rows_malformed,
            rows_discarded: worker_stats.rows_discarded,
            records_parsed: worker_stats.records_parsed,
            batches_committed: writer_stats.batches_committed,
            batches_failed: writer_stats.batches_failed,
            records_dropped: writer_stats.records_dropped,
            worker_errors,
            cancelled: reader_stats.cancelled,
            duration: started.elapsed(),
        };

        info!(
            records_persisted = report.records_persisted,
            rows_read = report.rows_read,
            rows_malformed = report.rows_malformed,
            rows_discarded = report.rows_discarded,
            batches_failed = report.batches_failed,
            records_dropped = report.records_dropped,
            worker_errors = report.worker_errors,
            cancelled = report.cancelled,
            duration_ms = report.duration.as_millis() as u64,
            "Ingestion pipeline finished"
        );

        Ok(report)
    }
}

async fn read_header(
    reader: &mut csv_async::AsyncReader<ObjectReader>,
    location: &ObjectLocation,
) -> IngestResult<ColumnMapping> {
    let mut header = StringRecord::new();
    let has_header = reader
        .read_record(&mut header)
        .await
        .map_err(|e| IngestError::SourceRead {
            location: location.clone(),
            line: 1,
            message: e.to_string(),
        })?;

    if !has_header {
        return ColumnMapping::resolve(std::iter::empty());
    }
    ColumnMapping::resolve(header.iter())
}

/// Tokenize data rows onto the row queue until end of stream or cancellation
async fn read_rows(
    mut reader: csv_async::AsyncReader<ObjectReader>,
    location: ObjectLocation,
    rows: mpsc::Sender<Row>,
    cancel: CancellationToken,
) -> IngestResult<ReaderStats> {
    let mut stats = ReaderStats::default();
    // The header was line 1
    let mut line = 1u64;

    loop {
        let mut fields = StringRecord::new();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stats.cancelled = true;
                break;
            }
            read = reader.read_record(&mut fields) => read,
        };
        line += 1;

        match read {
            Ok(false) => break,
            Ok(true) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        stats.cancelled = true;
                        break;
                    }
                    sent = rows.send(Row { line, fields }) => {
                        if sent.is_err() {
                            warn!(line, "Every parser worker has exited, stopping reader");
                            break;
                        }
                        // Counted once queued, so read = parsed + discarded
                        stats.rows_read += 1;
                    }
                }
            },
            Err(e) if e.is_io_error() => {
                return Err(IngestError::SourceRead {
                    location,
                    line,
                    message: e.to_string(),
                });
            },
            Err(e) => {
                stats.rows_malformed += 1;
                warn!(line, error = %e, "Skipping malformed row");
            },
        }
    }

    if stats.cancelled {
        info!(rows_read = stats.rows_read, "Reader cancelled, draining queued rows");
    }

    Ok(stats)
}

/// Parse rows from the shared queue until it is closed and empty
async fn parse_worker(
    id: usize,
    rows: SharedRows,
    records: mpsc::Sender<SubjectRecord>,
    mapping: Arc<ColumnMapping>,
) -> IngestResult<WorkerStats> {
    let mut stats = WorkerStats::default();

    loop {
        // Hold the lock only long enough to take one row
        let row = {
            let mut rx = rows.lock().await;
            rx.recv().await
        };
        let Some(row) = row else {
            break;
        };

        match parse_record(&row.fields, &mapping) {
            Ok(record) => {
                records.send(record).await.map_err(|_| IngestError::WorkerFatal {
                    worker: id,
                    message: "record queue closed while rows remained".to_string(),
                })?;
                stats.records_parsed += 1;
            },
            Err(reason) => {
                stats.rows_discarded += 1;
                debug!(worker = id, line = row.line, %reason, "Discarding row");
            },
        }
    }

    debug!(
        worker = id,
        records_parsed = stats.records_parsed,
        rows_discarded = stats.rows_discarded,
        "Parser worker finished"
    );
    Ok(stats)
}

/// Wait for every worker, summing their counters
///
/// Failed or panicked workers are forwarded to the error queue; the other
/// workers keep draining the row queue, so a single failure loses at most
/// the row that worker held.
async fn supervise(
    handles: Vec<JoinHandle<IngestResult<WorkerStats>>>,
    errors: mpsc::Sender<IngestError>,
) -> WorkerStats {
    let mut total = WorkerStats::default();

    for (id, joined) in join_all(handles).await.into_iter().enumerate() {
        let failure = match joined {
            Ok(Ok(stats)) => {
                total += stats;
                continue;
            },
            Ok(Err(e)) => e,
            Err(e) => IngestError::WorkerFatal {
                worker: id,
                message: e.to_string(),
            },
        };

        if errors.send(failure).await.is_err() {
            error!(worker = id, "Error queue closed before worker failure was reported");
        }
    }

    total
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::LocalSource;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    const HEADER: &str = "user_id,email,monthly_income,credit_score,employment_status,age\n";

    #[derive(Default)]
    struct MemoryStore {
        rows: StdMutex<HashMap<String, SubjectRecord>>,
        flushes: StdMutex<Vec<usize>>,
    }

    #[async_trait]
    impl SubjectStore for MemoryStore {
        async fn upsert_batch(&self, records: &[SubjectRecord]) -> IngestResult<()> {
            tokio::task::yield_now().await;
            self.flushes.lock().unwrap().push(records.len());
            let mut rows = self.rows.lock().unwrap();
            for record in records {
                rows.insert(record.subject_id.clone(), record.clone());
            }
            Ok(())
        }
    }

    fn write_csv(dir: &TempDir, name: &str, body: &str) -> ObjectLocation {
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads").join(name), body).unwrap();
        ObjectLocation::new("uploads", name)
    }

    fn rows(count: usize) -> String {
        let mut body = HEADER.to_string();
        for id in 0..count {
            body.push_str(&format!("U{id},u{id}@x.com,{id}.5,700,employed,30\n"));
        }
        body
    }

    fn pipeline(dir: &TempDir, store: Arc<MemoryStore>, config: PipelineConfig) -> IngestionPipeline {
        IngestionPipeline::new(Arc::new(LocalSource::new(dir.path())), store, config)
    }

    #[tokio::test]
    async fn test_small_queues_lose_nothing() {
        let dir = TempDir::new().unwrap();
        let location = write_csv(&dir, "many.csv", &rows(500));
        let store = Arc::new(MemoryStore::default());
        let config = PipelineConfig {
            workers: 3,
            queue_capacity: 1,
            batch_size: 7,
            ..Default::default()
        };

        let report = pipeline(&dir, store.clone(), config)
            .run(&location, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.rows_read, 500);
        assert_eq!(report.records_parsed, 500);
        assert_eq!(report.records_persisted, 500);
        assert_eq!(store.rows.lock().unwrap().len(), 500);
        assert_eq!(store.flushes.lock().unwrap().iter().sum::<usize>(), 500);
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_result() {
        let dir = TempDir::new().unwrap();
        let location = write_csv(&dir, "same.csv", &rows(200));

        let mut persisted = Vec::new();
        for workers in [1, 8] {
            let store = Arc::new(MemoryStore::default());
            let config = PipelineConfig {
                workers,
                queue_capacity: 4,
                batch_size: 16,
                ..Default::default()
            };
            let report = pipeline(&dir, store.clone(), config)
                .run(&location, CancellationToken::new())
                .await
                .unwrap();
            persisted.push((report.records_persisted, store.rows.lock().unwrap().len()));
        }

        assert_eq!(persisted, vec![(200, 200), (200, 200)]);
    }

    #[tokio::test]
    async fn test_schema_error_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let location = write_csv(&dir, "bad.csv", "user_id,email\nU1,a@x.com\n");
        let store = Arc::new(MemoryStore::default());

        let result = pipeline(&dir, store.clone(), PipelineConfig::default())
            .run(&location, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(IngestError::Schema { .. })));
        assert!(store.flushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_object_is_schema_error() {
        let dir = TempDir::new().unwrap();
        let location = write_csv(&dir, "empty.csv", "");
        let store = Arc::new(MemoryStore::default());

        let result = pipeline(&dir, store, PipelineConfig::default())
            .run(&location, CancellationToken::new())
            .await;

        match result {
            Err(IngestError::Schema { missing }) => assert_eq!(missing.len(), 6),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_header_only_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let location = write_csv(&dir, "header.csv", HEADER);
        let store = Arc::new(MemoryStore::default());

        let report = pipeline(&dir, store.clone(), PipelineConfig::default())
            .run(&location, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.records_persisted, 0);
        assert_eq!(report.rows_read, 0);
        assert!(store.flushes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "{HEADER}U1,a@x.com,10,700,employed,30\nU2,b@x.com,too,few\nU3,c@x.com,abc,700,employed,30\nU4,d@x.com,40,710,retired,61\n"
        );
        let location = write_csv(&dir, "mixed.csv", &body);
        let store = Arc::new(MemoryStore::default());

        let report = pipeline(&dir, store.clone(), PipelineConfig::default())
            .run(&location, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.rows_malformed, 1);
        assert_eq!(report.rows_discarded, 1);
        assert_eq!(report.records_persisted, 2);
        let rows = store.rows.lock().unwrap();
        assert!(rows.contains_key("U1") && rows.contains_key("U4"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let location = write_csv(&dir, "cancel.csv", &rows(50));
        let store = Arc::new(MemoryStore::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = pipeline(&dir, store.clone(), PipelineConfig::default())
            .run(&location, cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.rows_read, 0);
        assert_eq!(report.records_persisted, 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_source_error() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());

        let result = pipeline(&dir, store, PipelineConfig::default())
            .run(&ObjectLocation::new("uploads", "absent.csv"), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(IngestError::SourceConnect { .. })));
    }
}
