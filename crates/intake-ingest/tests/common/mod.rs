//! In-memory adapters for pipeline integration tests
//!
//! `MemorySource` serves objects from a map and `MemoryStore` keeps upserted
//! rows keyed by subject id, recording the size of every flush. Both
//! implement the same traits as the S3 and PostgreSQL adapters.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use intake_ingest::config::PipelineConfig;
use intake_ingest::ingest::{IngestionPipeline, SubjectRecord, SubjectStore};
use intake_ingest::storage::{ObjectLocation, ObjectReader, ObjectSource};
use intake_ingest::{IngestError, IngestResult};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const HEADER: &str = "user_id,email,monthly_income,credit_score,employment_status,age";

pub const BUCKET: &str = "uploads";

// ============================================================================
// Object source
// ============================================================================

#[derive(Clone)]
struct StoredObject {
    body: Vec<u8>,
    /// The stream fails once `body` has been read
    broken: bool,
}

#[derive(Default)]
pub struct MemorySource {
    objects: Mutex<HashMap<ObjectLocation, StoredObject>>,
}

impl MemorySource {
    pub fn put(&self, key: &str, body: impl Into<Vec<u8>>) -> ObjectLocation {
        self.insert(key, body.into(), false)
    }

    /// An object whose stream errors after yielding `prefix`
    pub fn put_broken(&self, key: &str, prefix: impl Into<Vec<u8>>) -> ObjectLocation {
        self.insert(key, prefix.into(), true)
    }

    fn insert(&self, key: &str, body: Vec<u8>, broken: bool) -> ObjectLocation {
        let location = ObjectLocation::new(BUCKET, key);
        self.objects
            .lock()
            .unwrap()
            .insert(location.clone(), StoredObject { body, broken });
        location
    }
}

/// Reader that fails every poll, standing in for a dropped connection
struct ConnectionReset;

impl AsyncRead for ConnectionReset {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")))
    }
}

#[async_trait]
impl ObjectSource for MemorySource {
    async fn open(&self, location: &ObjectLocation) -> IngestResult<ObjectReader> {
        let object = self
            .objects
            .lock()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| IngestError::source_connect(location, "NoSuchKey"))?;

        let body = io::Cursor::new(object.body);
        if object.broken {
            Ok(Box::pin(body.chain(ConnectionReset)))
        } else {
            Ok(Box::pin(body))
        }
    }
}

// ============================================================================
// Subject store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, SubjectRecord>>,
    flushes: Mutex<Vec<usize>>,
    /// Every subject id received, in flush order, duplicates included
    received: Mutex<Vec<String>>,
    /// 1-based flush numbers that fail without writing
    fail_on: Vec<usize>,
    /// Each flush waits for one permit
    gate: Option<Arc<Semaphore>>,
    /// Cancelled when the first flush arrives
    cancel_on_flush: Option<CancellationToken>,
}

impl MemoryStore {
    pub fn failing_on(fail_on: Vec<usize>) -> Self {
        Self {
            fail_on,
            ..Default::default()
        }
    }

    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }

    pub fn cancelling(token: CancellationToken) -> Self {
        Self {
            cancel_on_flush: Some(token),
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn get(&self, subject_id: &str) -> Option<SubjectRecord> {
        self.rows.lock().unwrap().get(subject_id).cloned()
    }

    pub fn flushes(&self) -> Vec<usize> {
        self.flushes.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn upsert_batch(&self, records: &[SubjectRecord]) -> IngestResult<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(token) = &self.cancel_on_flush {
            token.cancel();
            // Give the reader a chance to observe the cancellation mid-file
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let attempt = {
            let mut flushes = self.flushes.lock().unwrap();
            flushes.push(records.len());
            flushes.len()
        };
        if self.fail_on.contains(&attempt) {
            return Err(IngestError::Database(sqlx::Error::PoolTimedOut));
        }

        self.received
            .lock()
            .unwrap()
            .extend(records.iter().map(|r| r.subject_id.clone()));
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            rows.insert(record.subject_id.clone(), record.clone());
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// A CSV body with the canonical header followed by `rows`
pub fn csv(rows: &[&str]) -> String {
    let mut body = String::from(HEADER);
    for row in rows {
        body.push('\n');
        body.push_str(row);
    }
    body.push('\n');
    body
}

/// `count` valid rows with ids `U0..U{count-1}`
pub fn valid_rows(count: usize) -> Vec<String> {
    (0..count)
        .map(|id| format!("U{id},u{id}@x.com,{},700,employed,30", 1000 + id))
        .collect()
}

/// A CSV body of `count` valid rows
pub fn valid_csv(count: usize) -> String {
    let rows = valid_rows(count);
    csv(&rows.iter().map(String::as_str).collect::<Vec<_>>())
}

pub fn pipeline(
    source: Arc<MemorySource>,
    store: Arc<MemoryStore>,
    config: PipelineConfig,
) -> IngestionPipeline {
    IngestionPipeline::new(source, store, config)
}
