//! Core data types and error definitions for the annotation pipeline.

use crate::{
    annotation::{AnnotationResult, Gloss, ServiceError},
    config::ConfigError,
    document::DocumentError,
    metrics::MetricsSnapshot,
    store::StoreError,
};
use anyhow::Error as TokenizerError;
use std::ops::Range;
use thiserror::Error;

/// Errors produced while turning raw text into segments and chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Tokenizer resources were unavailable for the configured model.
    #[error("failed to initialize tokenizer for model '{model}': {source}")]
    Tokenizer {
        /// Model or encoding name we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
}

/// Errors emitted by an annotation run.
///
/// Every variant other than [`AnnotateError::Config`] can occur after chunks were already
/// committed; those chunks stay valid in the progress store for the next run.
#[derive(Debug, Error)]
pub enum AnnotateError {
    /// Run options were rejected before any work started.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Tokenizer setup failed.
    #[error("Failed to segment document: {0}")]
    Chunking(#[from] ChunkingError),
    /// Progress store could not be opened or written.
    #[error("Progress store failed: {0}")]
    Store(#[from] StoreError),
    /// Document reader or writer failed.
    #[error("Document I/O failed: {0}")]
    Document(#[from] DocumentError),
    /// A chunk kept failing transiently until its attempts ran out.
    #[error("Chunk {index} ({fingerprint}) failed after {attempts} attempts: {source}")]
    ChunkFailed {
        /// Position of the chunk in the plan.
        index: usize,
        /// Fingerprint of the chunk.
        fingerprint: String,
        /// Attempts issued before giving up.
        attempts: u32,
        /// Last error returned by the service.
        #[source]
        source: ServiceError,
    },
    /// The service rejected a chunk with a non-retryable error.
    #[error("Chunk {index} ({fingerprint}) was rejected: {source}")]
    Fatal {
        /// Position of the chunk in the plan.
        index: usize,
        /// Fingerprint of the chunk.
        fingerprint: String,
        /// Error returned by the service.
        #[source]
        source: ServiceError,
    },
    /// A chunk result was missing when reassembling the document.
    #[error("Chunk {index} was not resolved before assembly")]
    Assembly {
        /// Position of the missing chunk.
        index: usize,
    },
}

/// Atomic unit of source text carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position of the segment in the document.
    pub index: usize,
    /// Raw text content.
    pub content: String,
    /// Token count under the configured tokenizer.
    pub tokens: usize,
}

impl Segment {
    /// Whether the segment carries no visible text.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Contiguous run of segments selected by the planner, before fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Position of the chunk in the plan.
    pub index: usize,
    /// First segment position (inclusive).
    pub start: usize,
    /// Last segment position (exclusive).
    pub end: usize,
    /// Summed token count of the covered segments.
    pub tokens: usize,
}

impl ChunkRange {
    /// Segment positions covered by this chunk.
    pub fn segments(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Number of segments in the chunk.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the chunk covers no segments. Planned chunks never are.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Group of contiguous segments submitted as one annotation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the chunk in the plan.
    pub index: usize,
    /// Segment positions covered by the chunk.
    pub range: Range<usize>,
    /// Segment contents in document order.
    pub texts: Vec<String>,
    /// Summed token count of the segments.
    pub tokens: usize,
    /// Declared token budget (`max_chunk_tokens_count × (1 + gap_rate)`).
    pub budget: usize,
    /// Cache key for this chunk under the run configuration.
    pub fingerprint: String,
}

impl Chunk {
    /// Whether every segment in the chunk is blank.
    pub fn is_blank(&self) -> bool {
        self.texts.iter().all(|text| text.trim().is_empty())
    }

    /// Whether the chunk exceeds its budget, which only a lone oversized segment may do.
    pub fn is_oversized(&self) -> bool {
        self.tokens > self.budget
    }
}

/// Full ordered segment sequence for one run.
#[derive(Debug, Clone, Default)]
pub struct Book {
    /// Segments in document order.
    pub segments: Vec<Segment>,
    /// Sum of all segment token counts.
    pub total_tokens: usize,
}

impl Book {
    /// Collect segments into a book, summing their tokens.
    pub fn new(segments: Vec<Segment>) -> Self {
        let total_tokens = segments.iter().map(|segment| segment.tokens).sum();
        Self {
            segments,
            total_tokens,
        }
    }
}

/// How a chunk was resolved during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Result reused from the progress store.
    Cached,
    /// Result produced by the service after `attempts` calls.
    Annotated {
        /// Remote calls issued for the chunk.
        attempts: u32,
    },
    /// Chunk held only blank text; no call was made.
    Skipped,
}

/// A chunk together with its annotation result.
#[derive(Debug, Clone)]
pub struct ResolvedChunk {
    /// Position of the chunk in the plan.
    pub index: usize,
    /// Result covering the chunk's segments.
    pub result: AnnotationResult,
    /// Where the result came from.
    pub resolution: Resolution,
}

/// Segment paired with the glosses that apply to it, in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedSegment {
    /// Original segment.
    pub segment: Segment,
    /// Glosses whose `segment` field is the document position.
    pub glosses: Vec<Gloss>,
}

/// Summary of a completed annotation run.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    /// Segments in the book.
    pub segments: usize,
    /// Chunks planned for the book.
    pub chunks: usize,
    /// Total tokens across the book.
    pub total_tokens: usize,
    /// Counters collected during the run.
    pub metrics: MetricsSnapshot,
}
