//! Token-bounded chunk planning and chunk fingerprints.
//!
//! Planning is a greedy pass over the segment sequence:
//!
//! - Segments accumulate into the current chunk while the running token count stays within
//!   `max_chunk_tokens_count × (1 + gap_rate)`.
//! - The segment that would overflow the bound closes the chunk and opens the next one.
//! - A segment that exceeds the bound on its own becomes a singleton chunk; text is never
//!   truncated.
//!
//! The plan depends only on the segment token counts and the two options, so identical input
//! produces identical boundaries, which keeps fingerprints (and therefore the progress store)
//! stable across runs.

use sha2::{Digest, Sha256};

use super::types::{Chunk, ChunkRange, Segment};

/// Bumped whenever the request format changes so that older cache entries stop matching.
const FINGERPRINT_REVISION: &str = "bookgloss-annotation/2";

/// Greedy, order-preserving chunk planner.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    max_chunk_tokens_count: usize,
    gap_rate: f64,
}

impl ChunkPlanner {
    /// Build a planner. Options are expected to be validated through
    /// [`crate::config::RunConfig::validate`].
    pub fn new(max_chunk_tokens_count: usize, gap_rate: f64) -> Self {
        Self {
            max_chunk_tokens_count,
            gap_rate,
        }
    }

    /// Largest token count a multi-segment chunk may reach.
    pub fn bound(&self) -> usize {
        // The epsilon absorbs float error such as 100 × 1.15 = 114.99999999999999.
        let scaled = self.max_chunk_tokens_count as f64 * (1.0 + self.gap_rate) + 1e-9;
        (scaled.floor() as usize).max(1)
    }

    /// Partition segments into contiguous, non-overlapping ranges.
    ///
    /// Range positions are indices into `segments`.
    pub fn plan(&self, segments: &[Segment]) -> Vec<ChunkRange> {
        let bound = self.bound();
        let mut ranges = Vec::new();
        let mut start = 0;
        let mut running = 0;

        for (position, segment) in segments.iter().enumerate() {
            if position > start && running + segment.tokens > bound {
                ranges.push(ChunkRange {
                    index: ranges.len(),
                    start,
                    end: position,
                    tokens: running,
                });
                start = position;
                running = 0;
            }
            running += segment.tokens;
        }

        if start < segments.len() {
            ranges.push(ChunkRange {
                index: ranges.len(),
                start,
                end: segments.len(),
                tokens: running,
            });
        }

        ranges
    }

    /// Plan and fingerprint chunks in one pass.
    pub fn chunks(&self, segments: &[Segment], params: &FingerprintParams) -> Vec<Chunk> {
        let budget = self.bound();
        self.plan(segments)
            .into_iter()
            .map(|range| {
                let texts: Vec<String> = segments[range.segments()]
                    .iter()
                    .map(|segment| segment.content.clone())
                    .collect();
                let fingerprint = fingerprint(params, &texts);
                Chunk {
                    index: range.index,
                    range: range.segments(),
                    texts,
                    tokens: range.tokens,
                    budget,
                    fingerprint,
                }
            })
            .collect()
    }
}

/// Run parameters that change what the service would return for a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintParams {
    /// Language the glosses are written in.
    pub target_language: String,
    /// Model identifier reported by the annotation client.
    pub model: String,
    /// Other response-shaping settings reported by the annotation client, such as sampling.
    pub settings: Option<String>,
    /// Normalized user prompt, if any.
    pub user_prompt: Option<String>,
}

/// Compute the SHA-256 fingerprint of a chunk under the given parameters.
///
/// Every field is length-prefixed so that no two distinct inputs share an encoding.
pub fn fingerprint(params: &FingerprintParams, texts: &[String]) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, FINGERPRINT_REVISION.as_bytes());
    update_field(&mut hasher, params.target_language.as_bytes());
    update_field(&mut hasher, params.model.as_bytes());
    update_optional(&mut hasher, params.settings.as_deref());
    update_optional(&mut hasher, params.user_prompt.as_deref());
    hasher.update((texts.len() as u64).to_le_bytes());
    for text in texts {
        update_field(&mut hasher, text.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn update_optional(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(value) => {
            hasher.update([1u8]);
            update_field(hasher, value.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}
