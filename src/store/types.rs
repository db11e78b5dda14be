//! Persisted per-chunk state and store errors.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::annotation::AnnotationResult;

/// Errors returned by progress stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path involved in the failing operation.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A record could not be serialized.
    #[error("Failed to serialize progress record: {0}")]
    Serialize(#[from] serde_json::Error),
    /// A persisted record is unreadable or inconsistent. Lookups treat this as a miss.
    #[error("Corrupted progress record at {}: {reason}", path.display())]
    Corrupted {
        /// Location of the record.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
    /// Fingerprints must be non-empty hex strings.
    #[error("Invalid fingerprint: {0:?}")]
    InvalidKey(String),
}

/// Completion state of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Known but never dispatched.
    Pending,
    /// A worker is annotating the chunk, or a previous run stopped while it was.
    InProgress,
    /// Result persisted. Terminal.
    Done,
    /// The last dispatch failed terminally.
    Failed,
}

/// Persisted state for one chunk fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Chunk fingerprint this record belongs to.
    pub fingerprint: String,
    /// Current status.
    pub status: ChunkStatus,
    /// Annotation result, present exactly when `status` is `done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AnnotationResult>,
    /// Attempts spent on the latest dispatch.
    #[serde(default)]
    pub attempts: u32,
    /// Cause of the latest terminal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC 3339 timestamp of the last transition.
    pub updated_at: String,
}

impl ProgressRecord {
    /// Fresh record for a fingerprint seen for the first time.
    pub fn pending(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            status: ChunkStatus::Pending,
            result: None,
            attempts: 0,
            error: None,
            updated_at: current_timestamp_rfc3339(),
        }
    }

    /// Whether the record holds a reusable result.
    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Done && self.result.is_some()
    }

    /// Move to `in_progress`. Done records are returned unchanged.
    pub(crate) fn begin(self) -> Self {
        if self.is_done() {
            return self;
        }
        Self {
            status: ChunkStatus::InProgress,
            attempts: 0,
            error: None,
            result: None,
            updated_at: current_timestamp_rfc3339(),
            ..self
        }
    }

    /// Move to `done`. Done records keep their original result.
    pub(crate) fn complete(self, result: AnnotationResult, attempts: u32) -> Self {
        if self.is_done() {
            return self;
        }
        Self {
            status: ChunkStatus::Done,
            result: Some(result),
            attempts,
            error: None,
            updated_at: current_timestamp_rfc3339(),
            ..self
        }
    }

    /// Move to `failed`. Done records are returned unchanged.
    pub(crate) fn fail(self, cause: &str, attempts: u32) -> Self {
        if self.is_done() {
            return self;
        }
        Self {
            status: ChunkStatus::Failed,
            result: None,
            attempts,
            error: Some(cause.to_string()),
            updated_at: current_timestamp_rfc3339(),
            ..self
        }
    }

    /// Reason this record cannot be trusted, if any.
    pub(crate) fn inconsistency(&self, expected_fingerprint: &str) -> Option<String> {
        if self.fingerprint != expected_fingerprint {
            return Some(format!(
                "record belongs to fingerprint {}",
                self.fingerprint
            ));
        }
        match (self.status, self.result.is_some()) {
            (ChunkStatus::Done, false) => Some("done record without a result".into()),
            (ChunkStatus::Pending | ChunkStatus::InProgress | ChunkStatus::Failed, true) => {
                Some("unfinished record carries a result".into())
            }
            _ => None,
        }
    }
}

/// Reject fingerprints that could escape the store directory.
pub(crate) fn validate_fingerprint(fingerprint: &str) -> Result<(), StoreError> {
    if !fingerprint.is_empty() && fingerprint.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(fingerprint.to_string()))
    }
}

fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
