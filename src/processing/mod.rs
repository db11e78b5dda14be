//! Annotation pipeline: segmentation, chunk planning, dispatch, progress and assembly.

pub mod assemble;
pub mod chunking;
pub mod dispatch;
pub mod progress;
pub mod retry;
pub mod segmenter;
mod service;
pub mod tokens;
pub mod types;

pub use assemble::assemble;
pub use chunking::{ChunkPlanner, FingerprintParams, fingerprint};
pub use dispatch::Dispatcher;
pub use progress::{ProgressCallback, ProgressReporter};
pub use retry::{RetryError, RetryMachine, RetryPolicy, RetryState, RetryStep, run_with_retry};
pub use segmenter::{Segmenter, split_paragraphs};
pub use service::AnnotationPipeline;
pub use tokens::{
    TokenCounter, build_token_counter, token_counter_or_whitespace, whitespace_token_counter,
};
pub use types::{
    AnnotateError, AnnotatedSegment, Book, Chunk, ChunkRange, ChunkingError, Resolution,
    ResolvedChunk, RunOutcome, Segment,
};
