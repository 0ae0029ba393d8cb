//! Intake ingestion library
//!
//! Streams CSV subject files from object storage into PostgreSQL through a
//! bounded reader / parser pool / batch writer pipeline, then notifies a
//! downstream system of the persisted count.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use intake_ingest::config::PipelineConfig;
//! use intake_ingest::ingest::{IngestionPipeline, PgSubjectStore};
//! use intake_ingest::storage::{LocalSource, ObjectLocation};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(pool: sqlx::PgPool) -> intake_ingest::error::IngestResult<()> {
//! let pipeline = IngestionPipeline::new(
//!     Arc::new(LocalSource::new("./data")),
//!     Arc::new(PgSubjectStore::new(pool)),
//!     PipelineConfig::default(),
//! );
//! let report = pipeline
//!     .run(&ObjectLocation::new("uploads", "users.csv"), CancellationToken::new())
//!     .await?;
//! println!("persisted {} records", report.records_persisted);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod storage;

pub use error::{IngestError, IngestResult};
