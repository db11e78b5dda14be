//! Bounded-concurrency dispatch of chunks to the annotation service.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{StreamExt, stream};

use crate::{
    annotation::{AnnotationClient, AnnotationRequest, AnnotationResult, ServiceError},
    metrics::RunMetrics,
    store::ProgressStore,
};

use super::{
    progress::ProgressReporter,
    retry::{Retried, RetryError, RetryPolicy, run_with_retry},
    types::{AnnotateError, Chunk, Resolution, ResolvedChunk},
};

/// Chunks sharing one fingerprint; only the first member is sent to the service.
struct Group {
    members: Vec<usize>,
}

/// Resolves planned chunks from the progress store or the annotation service.
///
/// Resolution order within one call:
///
/// 1. Blank chunks resolve to an empty result without a remote call.
/// 2. Chunks with a `done` record whose result still fits the chunk resolve from the store.
/// 3. Everything else is annotated by at most `max_concurrency` workers. Chunks that share a
///    fingerprint are annotated once.
///
/// The first terminal failure stops the run. In-flight work is dropped without being
/// committed; records already committed stay valid for the next run.
pub struct Dispatcher {
    store: Arc<dyn ProgressStore>,
    client: Arc<dyn AnnotationClient>,
    policy: RetryPolicy,
    max_concurrency: usize,
    target_language: String,
    user_prompt: Option<String>,
    metrics: Arc<RunMetrics>,
}

impl Dispatcher {
    /// Create a dispatcher; `max_concurrency` is raised to at least one.
    pub fn new(
        store: Arc<dyn ProgressStore>,
        client: Arc<dyn AnnotationClient>,
        policy: RetryPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            client,
            policy,
            max_concurrency: max_concurrency.max(1),
            target_language: String::new(),
            user_prompt: None,
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    /// Language forwarded in every request.
    pub fn with_target_language(mut self, target_language: impl Into<String>) -> Self {
        self.target_language = target_language.into();
        self
    }

    /// Normalized user rules forwarded in every request.
    pub fn with_user_prompt(mut self, user_prompt: Option<String>) -> Self {
        self.user_prompt = user_prompt;
        self
    }

    /// Share a metrics accumulator with the caller.
    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Counters collected by this dispatcher.
    pub fn metrics(&self) -> &Arc<RunMetrics> {
        &self.metrics
    }

    /// Resolve every chunk, reporting progress as each one completes.
    ///
    /// The returned results are in completion order, not plan order.
    pub async fn dispatch(
        &self,
        chunks: &[Chunk],
        reporter: &ProgressReporter,
    ) -> Result<Vec<ResolvedChunk>, AnnotateError> {
        let mut resolved = Vec::with_capacity(chunks.len());
        let mut groups: Vec<Group> = Vec::new();
        let mut by_fingerprint: HashMap<&str, usize> = HashMap::new();

        for chunk in chunks {
            if chunk.is_blank() {
                tracing::debug!(chunk = chunk.index, "Skipping blank chunk");
                resolved.push(ResolvedChunk {
                    index: chunk.index,
                    result: AnnotationResult::default(),
                    resolution: Resolution::Skipped,
                });
                reporter.advance(chunk.tokens);
                continue;
            }

            if let Some(result) = self.cached_result(chunk) {
                tracing::debug!(
                    chunk = chunk.index,
                    fingerprint = %chunk.fingerprint,
                    "Reusing stored annotation"
                );
                self.metrics.record_cache_hit();
                resolved.push(ResolvedChunk {
                    index: chunk.index,
                    result,
                    resolution: Resolution::Cached,
                });
                reporter.advance(chunk.tokens);
                continue;
            }

            match by_fingerprint.get(chunk.fingerprint.as_str()) {
                Some(&group) => groups[group].members.push(chunk.index),
                None => {
                    by_fingerprint.insert(chunk.fingerprint.as_str(), groups.len());
                    groups.push(Group {
                        members: vec![chunk.index],
                    });
                }
            }
        }

        tracing::info!(
            chunks = chunks.len(),
            resolved_up_front = resolved.len(),
            to_annotate = groups.len(),
            max_concurrency = self.max_concurrency,
            "Dispatching chunks"
        );

        let mut in_flight = stream::iter(
            groups
                .into_iter()
                .map(|group| self.annotate_group(chunks, group)),
        )
        .buffer_unordered(self.max_concurrency);

        while let Some(outcome) = in_flight.next().await {
            for chunk in outcome? {
                reporter.advance(chunks[chunk.index].tokens);
                resolved.push(chunk);
            }
        }

        Ok(resolved)
    }

    /// Stored result for `chunk`, dropping records that do not belong to it.
    fn cached_result(&self, chunk: &Chunk) -> Option<AnnotationResult> {
        match self.store.lookup(&chunk.fingerprint) {
            Some(result) if result.fits(&chunk.texts) => Some(result),
            Some(_) => {
                tracing::warn!(
                    chunk = chunk.index,
                    fingerprint = %chunk.fingerprint,
                    "Stored annotation does not match its chunk; annotating again"
                );
                self.discard(chunk);
                None
            }
            None => None,
        }
    }

    /// Drop a stored record that does not belong to `chunk`. Failures are logged and the
    /// chunk is still treated as a miss.
    fn discard(&self, chunk: &Chunk) {
        if let Err(error) = self.store.invalidate(&chunk.fingerprint) {
            tracing::warn!(
                chunk = chunk.index,
                fingerprint = %chunk.fingerprint,
                error = %error,
                "Failed to remove stored annotation"
            );
        }
    }

    async fn annotate_group(
        &self,
        chunks: &[Chunk],
        group: Group,
    ) -> Result<Vec<ResolvedChunk>, AnnotateError> {
        let chunk = &chunks[group.members[0]];

        let record = self.store.begin(&chunk.fingerprint)?;
        if record.is_done() {
            // Another writer committed the fingerprint after the lookup pass.
            if let Some(result) = record.result.filter(|result| result.fits(&chunk.texts)) {
                for _ in &group.members {
                    self.metrics.record_cache_hit();
                }
                return Ok(resolve_all(&group, result, Resolution::Cached));
            }
            self.discard(chunk);
            self.store.begin(&chunk.fingerprint)?;
        }

        let request = AnnotationRequest {
            segments: chunk.texts.clone(),
            target_language: self.target_language.clone(),
            user_prompt: self.user_prompt.clone(),
            tokens: chunk.tokens,
            attempt: 1,
            max_attempts: self.policy.max_attempts(),
        };
        let request = &request;
        let client = self.client.as_ref();
        let index = chunk.index;

        let outcome = run_with_retry(self.policy, move |attempt| async move {
            tracing::debug!(chunk = index, attempt, "Requesting annotation");
            let request = AnnotationRequest {
                attempt,
                ..request.clone()
            };
            let result = client.annotate(&request).await?;
            if result.fits(&request.segments) {
                Ok(result)
            } else {
                Err(ServiceError::InvalidResponse(
                    "glosses do not point at terms in the chunk".into(),
                ))
            }
        })
        .await;

        match outcome {
            Ok(Retried { value, attempts }) => {
                self.store
                    .commit(&chunk.fingerprint, value.clone(), attempts)?;
                self.metrics.record_annotated(attempts, chunk.tokens);
                for _ in &group.members[1..] {
                    self.metrics.record_cache_hit();
                }
                tracing::info!(
                    chunk = chunk.index,
                    fingerprint = %chunk.fingerprint,
                    attempts,
                    glosses = value.glosses.len(),
                    "Chunk annotated"
                );
                let mut resolved = resolve_all(&group, value, Resolution::Cached);
                resolved[0].resolution = Resolution::Annotated { attempts };
                Ok(resolved)
            }
            Err(error) => {
                let attempts = error.attempts();
                self.metrics.record_failed(attempts);
                if let Err(store_error) =
                    self.store
                        .mark_failed(&chunk.fingerprint, &error.to_string(), attempts)
                {
                    tracing::error!(
                        chunk = chunk.index,
                        error = %store_error,
                        "Failed to record chunk failure"
                    );
                }
                tracing::error!(
                    chunk = chunk.index,
                    fingerprint = %chunk.fingerprint,
                    attempts,
                    error = %error,
                    "Chunk failed"
                );
                Err(match error {
                    RetryError::Fatal { source, .. } => AnnotateError::Fatal {
                        index: chunk.index,
                        fingerprint: chunk.fingerprint.clone(),
                        source,
                    },
                    RetryError::Exhausted { attempts, source } => AnnotateError::ChunkFailed {
                        index: chunk.index,
                        fingerprint: chunk.fingerprint.clone(),
                        attempts,
                        source,
                    },
                })
            }
        }
    }
}

fn resolve_all(group: &Group, result: AnnotationResult, resolution: Resolution) -> Vec<ResolvedChunk> {
    group
        .members
        .iter()
        .map(|&index| ResolvedChunk {
            index,
            result: result.clone(),
            resolution,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        annotation::Gloss,
        processing::{
            chunking::{ChunkPlanner, FingerprintParams},
            types::Segment,
        },
        store::{ChunkStatus, MemoryStore, ProgressRecord, StoreError},
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Replays scripted responses per first segment; unscripted chunks get an empty result.
    #[derive(Default)]
    struct ScriptedClient {
        calls: AtomicUsize,
        attempts: Mutex<Vec<(u32, u32)>>,
        scripts: Mutex<HashMap<String, VecDeque<Result<AnnotationResult, ServiceError>>>>,
    }

    impl ScriptedClient {
        fn script(self, first_segment: &str, responses: Vec<Result<AnnotationResult, ServiceError>>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(first_segment.to_string(), responses.into());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnnotationClient for ScriptedClient {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn annotate(
            &self,
            request: &AnnotationRequest,
        ) -> Result<AnnotationResult, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.attempts
                .lock()
                .unwrap()
                .push((request.attempt, request.max_attempts));
            let mut scripts = self.scripts.lock().unwrap();
            scripts
                .get_mut(&request.segments[0])
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(AnnotationResult::default()))
        }
    }

    fn chunks_for(texts: &[&str], tokens: usize) -> Vec<Chunk> {
        let segments: Vec<Segment> = texts
            .iter()
            .enumerate()
            .map(|(index, text)| Segment {
                index,
                content: text.to_string(),
                tokens,
            })
            .collect();
        let params = FingerprintParams {
            target_language: "English".into(),
            model: "scripted".into(),
            settings: None,
            user_prompt: None,
        };
        ChunkPlanner::new(tokens, 0.0).chunks(&segments, &params)
    }

    fn dispatcher(store: Arc<dyn ProgressStore>, client: Arc<ScriptedClient>, attempts: u32) -> Dispatcher {
        Dispatcher::new(store, client, RetryPolicy::new(attempts, Duration::ZERO), 4)
            .with_target_language("English")
    }

    fn gloss(term: &str, offset: usize) -> AnnotationResult {
        AnnotationResult {
            glosses: vec![Gloss {
                segment: 0,
                offset,
                term: term.into(),
                gloss: "x".into(),
            }],
        }
    }

    #[tokio::test]
    async fn annotates_and_commits_every_chunk() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default().script("la mer", vec![Ok(gloss("mer", 3))]));
        let chunks = chunks_for(&["la mer", "le ciel", "la terre"], 10);
        let dispatcher = dispatcher(store.clone(), client.clone(), 3);

        let resolved = dispatcher
            .dispatch(&chunks, &ProgressReporter::silent(30, chunks.len()))
            .await
            .unwrap();

        assert_eq!(resolved.len(), 3);
        assert_eq!(client.calls(), 3);
        for chunk in &chunks {
            assert_eq!(
                store.record(&chunk.fingerprint).unwrap().status,
                ChunkStatus::Done
            );
        }
        assert_eq!(store.lookup(&chunks[0].fingerprint), Some(gloss("mer", 3)));
        assert_eq!(dispatcher.metrics().snapshot().chunks_annotated, 3);
    }

    #[tokio::test]
    async fn retries_transient_failures_within_budget() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default().script(
            "la mer",
            vec![
                Err(ServiceError::RateLimited("slow down".into())),
                Err(ServiceError::Timeout("late".into())),
                Ok(gloss("mer", 3)),
            ],
        ));
        let chunks = chunks_for(&["la mer"], 10);

        let resolved = dispatcher(store, client.clone(), 3)
            .dispatch(&chunks, &ProgressReporter::silent(10, 1))
            .await
            .unwrap();

        assert_eq!(client.calls(), 3);
        assert_eq!(resolved[0].resolution, Resolution::Annotated { attempts: 3 });
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_chunk_failed() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default().script(
            "la mer",
            vec![
                Err(ServiceError::Transport("reset".into())),
                Err(ServiceError::Transport("reset".into())),
            ],
        ));
        let chunks = chunks_for(&["la mer"], 10);

        let error = dispatcher(store.clone(), client.clone(), 2)
            .dispatch(&chunks, &ProgressReporter::silent(10, 1))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AnnotateError::ChunkFailed { index: 0, attempts: 2, .. }
        ));
        assert_eq!(client.calls(), 2);
        let record = store.record(&chunks[0].fingerprint).unwrap();
        assert_eq!(record.status, ChunkStatus::Failed);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default().script(
            "la mer",
            vec![Err(ServiceError::Authentication("bad key".into()))],
        ));
        let chunks = chunks_for(&["la mer"], 10);

        let error = dispatcher(store, client.clone(), 5)
            .dispatch(&chunks, &ProgressReporter::silent(10, 1))
            .await
            .unwrap_err();

        assert!(matches!(error, AnnotateError::Fatal { index: 0, .. }));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn blank_chunks_skip_the_service() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default());
        let chunks = chunks_for(&["  ", "\n"], 10);

        let resolved = dispatcher(store.clone(), client.clone(), 3)
            .dispatch(&chunks, &ProgressReporter::silent(20, chunks.len()))
            .await
            .unwrap();

        assert_eq!(client.calls(), 0);
        assert!(resolved.iter().all(|r| r.resolution == Resolution::Skipped));
        assert_eq!(store.record(&chunks[0].fingerprint), None);
    }

    #[tokio::test]
    async fn duplicate_chunks_are_annotated_once() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default());
        let chunks = chunks_for(&["refrain", "couplet", "refrain"], 10);
        assert_eq!(chunks[0].fingerprint, chunks[2].fingerprint);

        let resolved = dispatcher(store, client.clone(), 3)
            .dispatch(&chunks, &ProgressReporter::silent(30, chunks.len()))
            .await
            .unwrap();

        assert_eq!(client.calls(), 2);
        assert_eq!(resolved.len(), 3);
    }

    #[tokio::test]
    async fn responses_that_do_not_fit_are_retried() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default().script(
            "la mer",
            vec![Ok(gloss("soleil", 0)), Ok(gloss("mer", 3))],
        ));
        let chunks = chunks_for(&["la mer"], 10);

        let resolved = dispatcher(store, client.clone(), 3)
            .dispatch(&chunks, &ProgressReporter::silent(10, 1))
            .await
            .unwrap();

        assert_eq!(client.calls(), 2);
        assert_eq!(resolved[0].result, gloss("mer", 3));
    }

    #[tokio::test]
    async fn stored_results_that_do_not_fit_are_redone() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let chunks = chunks_for(&["la mer"], 10);
        store
            .commit(&chunks[0].fingerprint, gloss("soleil", 0), 1)
            .unwrap();
        let client = Arc::new(ScriptedClient::default().script("la mer", vec![Ok(gloss("mer", 3))]));

        let resolved = dispatcher(store.clone(), client.clone(), 3)
            .dispatch(&chunks, &ProgressReporter::silent(10, 1))
            .await
            .unwrap();

        assert_eq!(client.calls(), 1);
        assert_eq!(store.lookup(&chunks[0].fingerprint), Some(gloss("mer", 3)));
        assert_eq!(resolved[0].resolution, Resolution::Annotated { attempts: 1 });
    }

    #[tokio::test]
    async fn requests_carry_their_attempt_number() {
        let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
        let client = Arc::new(ScriptedClient::default().script(
            "la mer",
            vec![
                Err(ServiceError::Timeout("late".into())),
                Err(ServiceError::Timeout("late".into())),
                Ok(gloss("mer", 3)),
            ],
        ));
        let chunks = chunks_for(&["la mer"], 10);

        dispatcher(store, client.clone(), 4)
            .dispatch(&chunks, &ProgressReporter::silent(10, 1))
            .await
            .unwrap();

        assert_eq!(*client.attempts.lock().unwrap(), vec![(1, 4), (2, 4), (3, 4)]);
    }

    /// Memory store whose `invalidate` always fails.
    struct StickyStore(MemoryStore);

    impl ProgressStore for StickyStore {
        fn lookup(&self, fingerprint: &str) -> Option<AnnotationResult> {
            self.0.lookup(fingerprint)
        }

        fn record(&self, fingerprint: &str) -> Option<ProgressRecord> {
            self.0.record(fingerprint)
        }

        fn begin(&self, fingerprint: &str) -> Result<ProgressRecord, StoreError> {
            self.0.begin(fingerprint)
        }

        fn commit(
            &self,
            fingerprint: &str,
            result: AnnotationResult,
            attempts: u32,
        ) -> Result<ProgressRecord, StoreError> {
            self.0.commit(fingerprint, result, attempts)
        }

        fn mark_failed(
            &self,
            fingerprint: &str,
            cause: &str,
            attempts: u32,
        ) -> Result<ProgressRecord, StoreError> {
            self.0.mark_failed(fingerprint, cause, attempts)
        }

        fn invalidate(&self, fingerprint: &str) -> Result<(), StoreError> {
            Err(StoreError::Io {
                path: format!("{fingerprint}.json").into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[tokio::test]
    async fn failing_to_drop_a_stale_record_does_not_stop_the_run() {
        let memory = MemoryStore::new();
        let chunks = chunks_for(&["la mer"], 10);
        memory
            .commit(&chunks[0].fingerprint, gloss("soleil", 0), 1)
            .unwrap();
        let store: Arc<dyn ProgressStore> = Arc::new(StickyStore(memory));
        let client = Arc::new(ScriptedClient::default().script("la mer", vec![Ok(gloss("mer", 3))]));

        let resolved = dispatcher(store, client.clone(), 3)
            .dispatch(&chunks, &ProgressReporter::silent(10, 1))
            .await
            .unwrap();

        assert_eq!(client.calls(), 1);
        assert_eq!(resolved[0].result, gloss("mer", 3));
        assert_eq!(resolved[0].resolution, Resolution::Annotated { attempts: 1 });
    }
}
