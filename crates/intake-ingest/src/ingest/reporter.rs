//! Completion reporting

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use super::models::IngestionReport;
use super::notify::{CompletionNotifier, CompletionPayload};
use crate::storage::ObjectLocation;

/// Logs the outcome of a file and tells the downstream system about it
///
/// Notification is fire and forget: the job's result never depends on it.
#[derive(Clone)]
pub struct CompletionReporter {
    notifier: Arc<dyn CompletionNotifier>,
}

impl CompletionReporter {
    pub fn new(notifier: Arc<dyn CompletionNotifier>) -> Self {
        Self { notifier }
    }

    /// Log the summary and dispatch the notification in the background
    ///
    /// The returned handle resolves once delivery has been attempted; callers
    /// that exit right after a job may await it, nothing else needs to.
    pub fn report(&self, location: &ObjectLocation, report: &IngestionReport) -> JoinHandle<()> {
        info!(
            location = %location,
            records_persisted = report.records_persisted,
            duration_ms = report.duration.as_millis() as u64,
            "Completed ingestion"
        );

        let payload = CompletionPayload::new(report.records_persisted, Utc::now());
        let notifier = self.notifier.clone();

        tokio::spawn(
            async move {
                if let Err(e) = notifier.notify(&payload).await {
                    warn!(error = %e, record_count = payload.record_count, "Completion notification failed");
                }
            }
            .in_current_span(),
        )
    }
}
