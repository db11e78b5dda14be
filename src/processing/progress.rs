//! Monotonic progress reporting shared by concurrent workers.

use std::sync::Mutex;

/// Callback receiving the resolved fraction of the book, in `[0.0, 1.0]`.
pub type ProgressCallback = Box<dyn Fn(f64) + Send + Sync>;

struct Tally {
    tokens: usize,
    chunks: usize,
    last: f64,
}

/// Accumulates resolved tokens and emits the resolved fraction of the book.
///
/// Updates and callback invocations happen under one lock, so the emitted sequence is
/// non-decreasing regardless of which worker resolves first. The fraction reaches `1.0` only
/// when the last chunk resolves.
pub struct ProgressReporter {
    total_tokens: usize,
    total_chunks: usize,
    tally: Mutex<Tally>,
    callback: ProgressCallback,
}

impl ProgressReporter {
    /// Create a reporter for a book of `total_tokens` split into `total_chunks`.
    pub fn new(total_tokens: usize, total_chunks: usize, callback: ProgressCallback) -> Self {
        Self {
            total_tokens,
            total_chunks,
            tally: Mutex::new(Tally {
                tokens: 0,
                chunks: 0,
                last: 0.0,
            }),
            callback,
        }
    }

    /// Reporter that discards every update.
    pub fn silent(total_tokens: usize, total_chunks: usize) -> Self {
        Self::new(total_tokens, total_chunks, Box::new(|_| {}))
    }

    /// Record one resolved chunk of `tokens` and emit the new fraction.
    pub fn advance(&self, tokens: usize) -> f64 {
        let mut tally = self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tally.tokens = tally.tokens.saturating_add(tokens);
        tally.chunks = tally.chunks.saturating_add(1);

        let fraction = if tally.chunks >= self.total_chunks {
            1.0
        } else if self.total_tokens == 0 {
            tally.last
        } else {
            let raw = tally.tokens as f64 / self.total_tokens as f64;
            raw.min(1.0 - f64::EPSILON).max(tally.last)
        };

        if fraction < 1.0 || tally.last < 1.0 {
            tally.last = fraction;
            (self.callback)(fraction);
        }
        fraction
    }

    /// Emit `1.0` for a run that had nothing to resolve.
    pub fn finish(&self) {
        let mut tally = self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tally.last < 1.0 && tally.chunks >= self.total_chunks {
            tally.last = 1.0;
            (self.callback)(1.0);
        }
    }

    /// Last fraction emitted.
    pub fn current(&self) -> f64 {
        self.tally
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .last
    }
}
