//! Resumable per-chunk progress storage.
//!
//! A [`ProgressStore`] maps chunk fingerprints to [`ProgressRecord`]s. Records move through
//! `pending → in_progress → {done | failed}`; `done` is terminal. A later run may restart a
//! fingerprint that is `in_progress` (an interrupted run) or `failed`.

mod directory;
mod memory;
mod types;

use std::path::Path;
use std::sync::Arc;

use crate::annotation::AnnotationResult;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;
pub use types::{ChunkStatus, ProgressRecord, StoreError};

/// Content-addressed progress storage shared by dispatcher workers.
pub trait ProgressStore: Send + Sync {
    /// Result of a `done` fingerprint. Corrupted records read as absent.
    fn lookup(&self, fingerprint: &str) -> Option<AnnotationResult>;

    /// Current record, if one exists and is readable.
    fn record(&self, fingerprint: &str) -> Option<ProgressRecord>;

    /// Mark a fingerprint `in_progress`, creating it if needed.
    ///
    /// A `done` record is returned unchanged so that the caller can reuse its result.
    fn begin(&self, fingerprint: &str) -> Result<ProgressRecord, StoreError>;

    /// Persist a result and mark the fingerprint `done`. Atomic with respect to crashes.
    fn commit(
        &self,
        fingerprint: &str,
        result: AnnotationResult,
        attempts: u32,
    ) -> Result<ProgressRecord, StoreError>;

    /// Mark the fingerprint `failed` with a diagnostic cause.
    fn mark_failed(
        &self,
        fingerprint: &str,
        cause: &str,
        attempts: u32,
    ) -> Result<ProgressRecord, StoreError>;

    /// Drop a record whose content turned out not to match its chunk.
    fn invalidate(&self, fingerprint: &str) -> Result<(), StoreError>;
}

/// Open the store for a run: directory-backed under `working_path`, in memory otherwise.
pub fn open_store(working_path: Option<&Path>) -> Result<Arc<dyn ProgressStore>, StoreError> {
    match working_path {
        Some(path) => Ok(Arc::new(DirectoryStore::open(path)?)),
        None => {
            tracing::debug!("No working path configured; progress is kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
