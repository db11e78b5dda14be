//! Shared types for annotation clients.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by annotation services.
///
/// Variants are split into transient ones, which the retry controller retries, and fatal
/// ones, which abort the run immediately.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The request did not complete before the client timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),
    /// The provider asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),
    /// Connection-level failure before a response arrived.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The provider answered with a server-side error status.
    #[error("Service unavailable ({status}): {body}")]
    Unavailable {
        /// HTTP status returned by the provider.
        status: u16,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// The provider answered, but the payload could not be understood.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
    /// Credentials were missing or rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// The provider rejected the request itself.
    #[error("Request rejected: {0}")]
    MalformedRequest(String),
    /// The provider cannot write glosses in the requested language.
    #[error("Unsupported target language: {0}")]
    UnsupportedLanguage(String),
    /// The client could not be constructed from its configuration.
    #[error("Client misconfigured: {0}")]
    Configuration(String),
}

impl ServiceError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::RateLimited(_)
                | Self::Transport(_)
                | Self::Unavailable { .. }
                | Self::InvalidResponse(_)
        )
    }
}

/// One gloss attached to a term occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gloss {
    /// Segment the term occurs in. Chunk-relative inside an [`AnnotationResult`].
    pub segment: usize,
    /// Byte offset of the term within the segment content.
    pub offset: usize,
    /// Term exactly as it appears in the text.
    pub term: String,
    /// Explanation written in the target language.
    pub gloss: String,
}

/// Service output for one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationResult {
    /// Glosses in reading order.
    pub glosses: Vec<Gloss>,
}

impl AnnotationResult {
    /// Whether every gloss points at its term inside `texts`.
    ///
    /// Used to reject cached results that do not belong to the chunk they are stored under.
    /// A span whose end would overflow `usize` does not fit.
    pub fn fits(&self, texts: &[String]) -> bool {
        self.glosses.iter().all(|gloss| {
            let Some(end) = gloss.offset.checked_add(gloss.term.len()) else {
                return false;
            };
            texts
                .get(gloss.segment)
                .and_then(|text| text.get(gloss.offset..end))
                .is_some_and(|found| found == gloss.term)
        })
    }
}

/// Request payload passed to an annotation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRequest {
    /// Segment contents of the chunk, in document order.
    pub segments: Vec<String>,
    /// Language the glosses are written in.
    pub target_language: String,
    /// Normalized user rules, if any.
    pub user_prompt: Option<String>,
    /// Token count of the chunk; used to size the response budget.
    pub tokens: usize,
    /// One-based attempt number within the retry budget.
    pub attempt: u32,
    /// Attempts allowed for this chunk.
    pub max_attempts: u32,
}

impl AnnotationRequest {
    /// Position of this attempt within the retry budget, from `0.0` (first) to `1.0` (last).
    pub fn retry_progress(&self) -> f64 {
        if self.max_attempts <= 1 {
            return 0.0;
        }
        let done = self.attempt.clamp(1, self.max_attempts) - 1;
        f64::from(done) / f64::from(self.max_attempts - 1)
    }
}

/// Interface implemented by annotation backends.
#[async_trait]
pub trait AnnotationClient: Send + Sync {
    /// Model identifier; part of every chunk fingerprint.
    fn model(&self) -> &str;

    /// Other settings that shape responses, such as sampling; part of every chunk fingerprint.
    fn settings(&self) -> Option<String> {
        None
    }

    /// Produce glosses for one chunk.
    async fn annotate(
        &self,
        request: &AnnotationRequest,
    ) -> Result<AnnotationResult, ServiceError>;
}
