//! CSV subject ingestion
//!
//! Streams a delimited object from a blob store into the `subjects` table.

pub mod columns;
pub mod event;
pub mod models;
pub mod notify;
pub mod parser;
pub mod pipeline;
pub mod reporter;
pub mod runner;
pub mod store;
pub mod writer;

pub use columns::ColumnMapping;
pub use event::FileArrivalEvent;
pub use models::{IngestionReport, SubjectRecord};
pub use notify::{CompletionNotifier, CompletionPayload, LogNotifier, WebhookNotifier};
pub use parser::parse_record;
pub use pipeline::IngestionPipeline;
pub use reporter::CompletionReporter;
pub use runner::{BatchOutcome, JobRunner};
pub use store::PgSubjectStore;
pub use writer::{BatchWriter, SubjectStore};
