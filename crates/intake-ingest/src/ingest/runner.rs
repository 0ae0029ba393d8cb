//! Job entry point
//!
//! Runs the pipeline once per object named by an event, reporting each
//! successful file. A failed file is recorded and the next one still runs.

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::event::FileArrivalEvent;
use super::models::IngestionReport;
use super::pipeline::IngestionPipeline;
use super::reporter::CompletionReporter;
use crate::storage::ObjectLocation;

#[derive(Debug, Clone, Serialize)]
pub struct FileSuccess {
    pub location: ObjectLocation,
    pub report: IngestionReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub location: ObjectLocation,
    pub error: String,
}

/// Per-file results of one event
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<FileSuccess>,
    pub failed: Vec<FileFailure>,
    /// Files never started because the run was cancelled
    pub skipped: Vec<ObjectLocation>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn records_persisted(&self) -> u64 {
        self.succeeded.iter().map(|s| s.report.records_persisted).sum()
    }
}

pub struct JobRunner {
    pipeline: IngestionPipeline,
    reporter: CompletionReporter,
    cancel: CancellationToken,
    notifications: Vec<JoinHandle<()>>,
}

impl JobRunner {
    pub fn new(
        pipeline: IngestionPipeline,
        reporter: CompletionReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            reporter,
            cancel,
            notifications: Vec::new(),
        }
    }

    /// Ingest every file of `event` in order
    pub async fn run_event(&mut self, event: &FileArrivalEvent) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for location in &event.files {
            if self.cancel.is_cancelled() {
                warn!(location = %location, "Run cancelled, skipping file");
                outcome.skipped.push(location.clone());
                continue;
            }

            info!(location = %location, "Processing file");
            match self.pipeline.run(location, self.cancel.clone()).await {
                Ok(report) => {
                    self.notifications.push(self.reporter.report(location, &report));
                    outcome.succeeded.push(FileSuccess {
                        location: location.clone(),
                        report,
                    });
                },
                Err(e) => {
                    error!(location = %location, error = %e, fatal = e.is_fatal(), "File failed");
                    outcome.failed.push(FileFailure {
                        location: location.clone(),
                        error: e.to_string(),
                    });
                },
            }
        }

        info!(
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            skipped = outcome.skipped.len(),
            records_persisted = outcome.records_persisted(),
            "Event processed"
        );

        outcome
    }

    /// Wait for notifications still in flight
    pub async fn drain_notifications(&mut self) {
        for handle in self.notifications.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Notification task did not complete");
            }
        }
    }
}
