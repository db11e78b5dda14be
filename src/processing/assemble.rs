//! Merge chunk results back into document order.

use crate::annotation::Gloss;

use super::types::{AnnotateError, AnnotatedSegment, Book, Chunk, ResolvedChunk};

/// Attach every resolved chunk's glosses to its document segments.
///
/// `resolved` may arrive in any order; the output follows the book's segment order, and each
/// segment's glosses are ordered by offset. Gloss `segment` fields are rewritten from
/// chunk-relative to document positions.
pub fn assemble(
    book: &Book,
    chunks: &[Chunk],
    resolved: Vec<ResolvedChunk>,
) -> Result<Vec<AnnotatedSegment>, AnnotateError> {
    let mut slots: Vec<Option<ResolvedChunk>> = vec![None; chunks.len()];
    for chunk in resolved {
        let index = chunk.index;
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(chunk);
        } else {
            tracing::warn!(index, "Ignoring result for a chunk outside of the plan");
        }
    }

    let mut glosses: Vec<Vec<Gloss>> = vec![Vec::new(); book.segments.len()];
    for (chunk, slot) in chunks.iter().zip(slots) {
        let resolved = slot.ok_or(AnnotateError::Assembly { index: chunk.index })?;
        for gloss in resolved.result.glosses {
            let position = chunk.range.start + gloss.segment;
            if position >= chunk.range.end {
                tracing::warn!(
                    chunk = chunk.index,
                    segment = gloss.segment,
                    "Dropping gloss that points past its chunk"
                );
                continue;
            }
            glosses[position].push(Gloss {
                segment: position,
                ..gloss
            });
        }
    }

    Ok(book
        .segments
        .iter()
        .cloned()
        .zip(glosses)
        .map(|(segment, mut glosses)| {
            glosses.sort_by_key(|gloss| gloss.offset);
            AnnotatedSegment { segment, glosses }
        })
        .collect())
}
