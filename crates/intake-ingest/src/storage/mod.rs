//! Blob store access
//!
//! The pipeline only needs one capability from the blob store: open an
//! object for a sequential read. [`ObjectSource`] is that seam; [`S3Source`]
//! serves production, [`LocalSource`] serves development runs against a
//! directory tree laid out as `<root>/<bucket>/<key>`.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    Client,
};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncRead;
use tracing::{debug, info, instrument};

use crate::error::{IngestError, IngestResult};

pub mod config;

pub use config::StorageConfig;

/// Sequential byte stream over one object
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Identity of one object in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Open `location` for a sequential read
    ///
    /// Failing to reach or find the object is a `SourceConnect` error.
    async fn open(&self, location: &ObjectLocation) -> IngestResult<ObjectReader>;
}

/// Reads objects from S3 or any S3-compatible endpoint
#[derive(Clone)]
pub struct S3Source {
    client: Client,
}

impl S3Source {
    pub async fn new(config: StorageConfig) -> Self {
        debug!("Initializing S3 source with config: {:?}", config);

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "intake-storage",
            ));
        }

        let sdk_config = loader.load().await;
        let mut builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(region = %config.region, endpoint = ?config.endpoint, "S3 source initialized");

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectSource for S3Source {
    #[instrument(skip(self), fields(location = %location))]
    async fn open(&self, location: &ObjectLocation) -> IngestResult<ObjectReader> {
        let response = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| IngestError::source_connect(location, DisplayErrorContext(&e)))?;

        debug!(content_length = ?response.content_length(), "Opened object stream");

        Ok(Box::pin(response.body.into_async_read()))
    }
}

/// Reads objects from a local directory tree
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &ObjectLocation) -> IngestResult<PathBuf> {
        let relative = Path::new(&location.bucket).join(&location.key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));

        if escapes {
            return Err(IngestError::source_connect(
                location,
                "object path must stay inside the source root",
            ));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectSource for LocalSource {
    async fn open(&self, location: &ObjectLocation) -> IngestResult<ObjectReader> {
        let path = self.resolve(location)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| IngestError::source_connect(location, format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Opened local object");

        Ok(Box::pin(file))
    }
}
