use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing one annotation run.
#[derive(Default)]
pub struct RunMetrics {
    chunks_cached: AtomicU64,
    chunks_annotated: AtomicU64,
    chunks_failed: AtomicU64,
    attempts: AtomicU64,
    tokens_annotated: AtomicU64,
}

impl RunMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk resolved from the progress store.
    pub fn record_cache_hit(&self) {
        self.chunks_cached.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a freshly annotated chunk and the attempts it took.
    pub fn record_annotated(&self, attempts: u32, tokens: usize) {
        self.chunks_annotated.fetch_add(1, Ordering::Relaxed);
        self.attempts.fetch_add(u64::from(attempts), Ordering::Relaxed);
        self.tokens_annotated
            .fetch_add(tokens as u64, Ordering::Relaxed);
    }

    /// Record a chunk that failed terminally.
    pub fn record_failed(&self, attempts: u32) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
        self.attempts.fetch_add(u64::from(attempts), Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_cached: self.chunks_cached.load(Ordering::Relaxed),
            chunks_annotated: self.chunks_annotated.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            tokens_annotated: self.tokens_annotated.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of run counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Chunks reused from the progress store without a remote call.
    pub chunks_cached: u64,
    /// Chunks annotated by the remote service during this run.
    pub chunks_annotated: u64,
    /// Chunks that failed terminally.
    pub chunks_failed: u64,
    /// Remote calls issued, retries included.
    pub attempts: u64,
    /// Tokens covered by freshly annotated chunks.
    pub tokens_annotated: u64,
}

impl MetricsSnapshot {
    /// Remote calls beyond the first attempt of each chunk.
    pub fn retries(&self) -> u64 {
        self.attempts
            .saturating_sub(self.chunks_annotated + self.chunks_failed)
    }
}
