//! Completion notifiers

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};

/// Trigger name sent with every completion payload
pub const CSV_PROCESSED: &str = "csv_processed";

/// Body delivered to the downstream system after a file is ingested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionPayload {
    pub trigger: String,
    pub record_count: u64,
    /// RFC 3339, UTC
    pub timestamp: String,
}

impl CompletionPayload {
    pub fn new(record_count: u64, at: DateTime<Utc>) -> Self {
        Self {
            trigger: CSV_PROCESSED.to_string(),
            record_count,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Downstream receiver of completion events
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, payload: &CompletionPayload) -> IngestResult<()>;
}

/// Posts the payload as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> IngestResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("intake-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, payload: &CompletionPayload) -> IngestResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| IngestError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestError::Notification(format!(
                "webhook returned {}: {}",
                status,
                body.trim()
            )));
        }

        debug!(status = %status, record_count = payload.record_count, "Webhook accepted completion");
        Ok(())
    }
}

/// Records the completion in the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, payload: &CompletionPayload) -> IngestResult<()> {
        info!(
            trigger = %payload.trigger,
            record_count = payload.record_count,
            timestamp = %payload.timestamp,
            "Completion event"
        );
        Ok(())
    }
}
