//! Per-request transcripts.
//!
//! When enabled, every chat-completions call writes one file named after the time it was sent,
//! holding the request payload followed by the model reply or the error it ended with. Writing
//! a transcript never fails the request.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use super::types::ServiceError;

/// Directory receiving request transcripts.
#[derive(Debug, Clone)]
pub(crate) struct RequestLog {
    dir: PathBuf,
}

impl RequestLog {
    /// Use `dir` for transcripts, creating it if needed. Returns `None`, after a warning, when
    /// the path cannot hold files.
    pub(crate) fn open(dir: &Path) -> Option<Self> {
        if dir.exists() && !dir.is_dir() {
            tracing::warn!(path = %dir.display(), "Request log path is not a directory; disabled");
            return None;
        }
        if let Err(error) = std::fs::create_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %error, "Cannot create request log directory; disabled");
            return None;
        }
        Some(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Write one transcript for a finished request.
    pub(crate) async fn record(
        &self,
        attempt: u32,
        payload: &Value,
        outcome: &Result<String, ServiceError>,
    ) {
        let sent_at = timestamp();
        let path = self.dir.join(format!(
            "request {} {}.log",
            sent_at.replace(':', "-"),
            &Uuid::new_v4().simple().to_string()[..8]
        ));

        let mut body = String::new();
        let request = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
        let _ = writeln!(body, "{sent_at}    request (attempt {attempt})\n{request}\n");
        match outcome {
            Ok(content) => {
                let _ = writeln!(body, "{}    response\n{content}", timestamp());
            }
            Err(error) => {
                let _ = writeln!(body, "{}    error\n{error}", timestamp());
            }
        }

        if let Err(error) = tokio::fs::write(&path, body).await {
            tracing::warn!(path = %path.display(), error = %error, "Failed to write request log");
        }
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
