//! Volatile progress store for runs without a working path.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::annotation::AnnotationResult;

use super::ProgressStore;
use super::types::{ProgressRecord, StoreError};

/// Process-local store; records live as long as the value.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ProgressRecord>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ProgressRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<F>(&self, fingerprint: &str, transition: F) -> ProgressRecord
    where
        F: FnOnce(ProgressRecord) -> ProgressRecord,
    {
        let mut records = self.write();
        let current = records
            .remove(fingerprint)
            .unwrap_or_else(|| ProgressRecord::pending(fingerprint));
        let next = transition(current);
        records.insert(fingerprint.to_string(), next.clone());
        next
    }
}

impl ProgressStore for MemoryStore {
    fn lookup(&self, fingerprint: &str) -> Option<AnnotationResult> {
        self.read()
            .get(fingerprint)
            .filter(|record| record.is_done())
            .and_then(|record| record.result.clone())
    }

    fn record(&self, fingerprint: &str) -> Option<ProgressRecord> {
        self.read().get(fingerprint).cloned()
    }

    fn begin(&self, fingerprint: &str) -> Result<ProgressRecord, StoreError> {
        Ok(self.update(fingerprint, ProgressRecord::begin))
    }

    fn commit(
        &self,
        fingerprint: &str,
        result: AnnotationResult,
        attempts: u32,
    ) -> Result<ProgressRecord, StoreError> {
        Ok(self.update(fingerprint, |record| record.complete(result, attempts)))
    }

    fn mark_failed(
        &self,
        fingerprint: &str,
        cause: &str,
        attempts: u32,
    ) -> Result<ProgressRecord, StoreError> {
        Ok(self.update(fingerprint, |record| record.fail(cause, attempts)))
    }

    fn invalidate(&self, fingerprint: &str) -> Result<(), StoreError> {
        self.write().remove(fingerprint);
        Ok(())
    }
}
