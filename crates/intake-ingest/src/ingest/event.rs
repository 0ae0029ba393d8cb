//! File arrival events
//!
//! Two shapes are accepted: the plain list the CLI and schedulers produce,
//!
//! ```json
//! {"files": [{"bucket": "uploads", "key": "2026/03/users.csv"}]}
//! ```
//!
//! and the object store's own bucket notification, whose keys arrive
//! form-encoded (`+` for space, percent escapes).

use intake_common::{IntakeError, Result};
use serde::Deserialize;
use std::path::Path;

use crate::storage::ObjectLocation;

/// The set of objects one invocation should ingest, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArrivalEvent {
    pub files: Vec<ObjectLocation>,
}

impl FileArrivalEvent {
    pub fn single(location: ObjectLocation) -> Self {
        Self {
            files: vec![location],
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let wire: WireEvent = serde_json::from_str(raw)?;
        wire.into_event()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireEvent {
    Plain {
        files: Vec<ObjectLocation>,
    },
    Notification {
        #[serde(rename = "Records")]
        records: Vec<NotificationRecord>,
    },
}

#[derive(Deserialize)]
struct NotificationRecord {
    s3: NotificationEntity,
}

#[derive(Deserialize)]
struct NotificationEntity {
    bucket: NamedBucket,
    object: NotificationObject,
}

#[derive(Deserialize)]
struct NamedBucket {
    name: String,
}

#[derive(Deserialize)]
struct NotificationObject {
    key: String,
}

impl WireEvent {
    fn into_event(self) -> Result<FileArrivalEvent> {
        let files = match self {
            WireEvent::Plain { files } => files,
            WireEvent::Notification { records } => records
                .into_iter()
                .map(|record| {
                    let key = decode_key(&record.s3.object.key)?;
                    Ok(ObjectLocation::new(record.s3.bucket.name, key))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        if let Some(blank) = files.iter().find(|f| f.bucket.is_empty() || f.key.is_empty()) {
            return Err(IntakeError::Parse(format!("Event names an incomplete object: {}", blank)));
        }

        Ok(FileArrivalEvent { files })
    }
}

fn decode_key(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|e| IntakeError::Parse(format!("Object key {} is not valid UTF-8: {}", raw, e)))
}
