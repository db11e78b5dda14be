//! Directory-backed progress store.
//!
//! Layout: one JSON record per fingerprint at `<working_path>/cache/<fingerprint>.json`.
//! Every write goes to a uniquely named temporary file in the same directory, is synced, and
//! is then renamed over the record, so readers observe either the previous record or the new
//! one. Writers for the same fingerprint are serialized by a per-fingerprint lock; distinct
//! fingerprints never wait on each other. The store never deletes healthy records.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::annotation::AnnotationResult;

use super::ProgressStore;
use super::types::{ProgressRecord, StoreError, validate_fingerprint};

const CACHE_DIR: &str = "cache";

/// Persistent store rooted under a caller-supplied working path.
pub struct DirectoryStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DirectoryStore {
    /// Open (creating if needed) the store under `working_path`.
    pub fn open(working_path: &Path) -> Result<Self, StoreError> {
        let root = working_path.join(CACHE_DIR);
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        tracing::debug!(path = %root.display(), "Opened progress store");
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the record files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{fingerprint}.json"))
    }

    /// Run `work` while holding the lock for `fingerprint`.
    ///
    /// Lock entries only live while someone holds or waits for them.
    fn locked<T>(&self, fingerprint: &str, work: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.lock_map();
            locks
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let outcome = {
            let _guard: MutexGuard<'_, ()> =
                lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            work()
        };

        let mut locks = self.lock_map();
        drop(lock);
        if locks
            .get(fingerprint)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(fingerprint);
        }
        outcome
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read a record, distinguishing "absent" from "corrupted".
    fn read_record(&self, fingerprint: &str) -> Result<Option<ProgressRecord>, StoreError> {
        let path = self.record_path(fingerprint);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(StoreError::Corrupted {
                    path,
                    reason: format!("unreadable: {error}"),
                });
            }
        };
        let record: ProgressRecord =
            serde_json::from_slice(&bytes).map_err(|error| StoreError::Corrupted {
                path: path.clone(),
                reason: format!("malformed: {error}"),
            })?;
        if let Some(reason) = record.inconsistency(fingerprint) {
            return Err(StoreError::Corrupted { path, reason });
        }
        Ok(Some(record))
    }

    /// Read a record, logging corruption and reporting it as absent.
    fn load(&self, fingerprint: &str) -> Option<ProgressRecord> {
        match self.read_record(fingerprint) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(fingerprint, error = %error, "Ignoring corrupted progress record");
                None
            }
        }
    }

    fn write_record(&self, record: &ProgressRecord) -> Result<(), StoreError> {
        let target = self.record_path(&record.fingerprint);
        let temp = self
            .root
            .join(format!(".{}.{}.tmp", record.fingerprint, Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(record)?;

        let written = File::create(&temp).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&temp);
            return Err(StoreError::Io { path: temp, source });
        }
        if let Err(source) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(StoreError::Io {
                path: target,
                source,
            });
        }
        Ok(())
    }

    fn update<F>(&self, fingerprint: &str, transition: F) -> Result<ProgressRecord, StoreError>
    where
        F: FnOnce(ProgressRecord) -> ProgressRecord,
    {
        validate_fingerprint(fingerprint)?;
        self.locked(fingerprint, || {
            let current = self
                .load(fingerprint)
                .unwrap_or_else(|| ProgressRecord::pending(fingerprint));
            let next = transition(current.clone());
            if next != current {
                self.write_record(&next)?;
            }
            Ok(next)
        })
    }
}

impl ProgressStore for DirectoryStore {
    fn lookup(&self, fingerprint: &str) -> Option<AnnotationResult> {
        validate_fingerprint(fingerprint).ok()?;
        self.load(fingerprint)
            .filter(ProgressRecord::is_done)
            .and_then(|record| record.result)
    }

    fn record(&self, fingerprint: &str) -> Option<ProgressRecord> {
        validate_fingerprint(fingerprint).ok()?;
        self.load(fingerprint)
    }

    fn begin(&self, fingerprint: &str) -> Result<ProgressRecord, StoreError> {
        self.update(fingerprint, ProgressRecord::begin)
    }

    fn commit(
        &self,
        fingerprint: &str,
        result: AnnotationResult,
        attempts: u32,
    ) -> Result<ProgressRecord, StoreError> {
        self.update(fingerprint, |record| record.complete(result, attempts))
    }

    fn mark_failed(
        &self,
        fingerprint: &str,
        cause: &str,
        attempts: u32,
    ) -> Result<ProgressRecord, StoreError> {
        self.update(fingerprint, |record| record.fail(cause, attempts))
    }

    fn invalidate(&self, fingerprint: &str) -> Result<(), StoreError> {
        validate_fingerprint(fingerprint)?;
        self.locked(fingerprint, || {
            let path = self.record_path(fingerprint);
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(fingerprint, "Removed invalid progress record");
                    Ok(())
                }
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                Err(source) => Err(StoreError::Io { path, source }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Gloss;
    use crate::store::ChunkStatus;
    use tempfile::tempdir;

    const FP: &str = "0123abcd";

    fn result() -> AnnotationResult {
        AnnotationResult {
            glosses: vec![Gloss {
                segment: 0,
                offset: 3,
                term: "mer".into(),
                gloss: "sea".into(),
            }],
        }
    }

    #[test]
    fn committed_results_survive_reopening() {
        let dir = tempdir().unwrap();
        {
            let store = DirectoryStore::open(dir.path()).unwrap();
            store.begin(FP).unwrap();
            store.commit(FP, result(), 2).unwrap();
        }

        let reopened = DirectoryStore::open(dir.path()).unwrap();
        assert_eq!(reopened.lookup(FP), Some(result()));
        let record = reopened.record(FP).unwrap();
        assert_eq!(record.status, ChunkStatus::Done);
        assert_eq!(record.attempts, 2);
        assert!(dir.path().join("cache").join(format!("{FP}.json")).exists());
    }

    #[test]
    fn unfinished_records_are_not_results() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.begin(FP).unwrap();
        assert_eq!(store.lookup(FP), None);

        store.mark_failed(FP, "rate limited", 5).unwrap();
        assert_eq!(store.lookup(FP), None);
        let record = store.record(FP).unwrap();
        assert_eq!(record.status, ChunkStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn malformed_record_is_a_miss() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        fs::write(store.root().join(format!("{FP}.json")), b"{ not json").unwrap();

        assert_eq!(store.lookup(FP), None);
        assert_eq!(store.record(FP), None);

        store.begin(FP).unwrap();
        store.commit(FP, result(), 1).unwrap();
        assert_eq!(store.lookup(FP), Some(result()));
    }

    #[test]
    fn done_record_without_result_is_a_miss() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        let body = format!(
            r#"{{"fingerprint":"{FP}","status":"done","attempts":1,"updated_at":"2025-01-01T00:00:00Z"}}"#
        );
        fs::write(store.root().join(format!("{FP}.json")), body).unwrap();
        assert_eq!(store.lookup(FP), None);
    }

    #[test]
    fn record_under_wrong_name_is_a_miss() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.begin("ffff").unwrap();
        store.commit("ffff", result(), 1).unwrap();
        fs::copy(
            store.root().join("ffff.json"),
            store.root().join(format!("{FP}.json")),
        )
        .unwrap();
        assert_eq!(store.lookup(FP), None);
    }

    #[test]
    fn no_temporary_files_are_left_behind() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.begin(FP).unwrap();
        store.commit(FP, result(), 1).unwrap();

        let names: Vec<String> = fs::read_dir(store.root())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{FP}.json")]);
    }

    #[test]
    fn invalidate_removes_the_record() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        store.commit(FP, result(), 1).unwrap();
        store.invalidate(FP).unwrap();
        assert_eq!(store.record(FP), None);
        store.invalidate(FP).unwrap();
    }

    #[test]
    fn rejects_path_like_fingerprints() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.begin("../escape"),
            Err(StoreError::InvalidKey(_))
        ));
        assert_eq!(store.lookup("../escape"), None);
    }

    #[test]
    fn concurrent_commits_do_not_interfere() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DirectoryStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..16u32)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let fingerprint = format!("{i:08x}");
                    store.begin(&fingerprint).unwrap();
                    store.commit(&fingerprint, result(), i + 1).unwrap();
                    // Same fingerprint from a second writer: done stays terminal.
                    store.commit("0000beef", result(), i + 1).unwrap();
                    store.lookup("0000beef")
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(result()));
        }

        for i in 0..16u32 {
            let record = store.record(&format!("{i:08x}")).unwrap();
            assert!(record.is_done());
            assert_eq!(record.attempts, i + 1);
        }
        assert!(store.record("0000beef").unwrap().is_done());
    }

    #[test]
    fn locks_are_released_once_writers_finish() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DirectoryStore::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for round in 0..32u32 {
                        let fingerprint = format!("{:08x}", i * 1000 + round);
                        store.begin(&fingerprint).unwrap();
                        store.commit(&fingerprint, result(), 1).unwrap();
                        store.begin("0000beef").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        store.invalidate("0000beef").unwrap();

        assert!(store.lock_map().is_empty());
    }
}
