//! Match `term: explanation` response lines to the segments they gloss.
//!
//! The model answers one line per entry in reading order. Lines are consumed greedily,
//! segment by segment:
//!
//! - a term found in the current segment is attached there;
//! - a term found nowhere in the chunk is dropped;
//! - a term found only further on stops matching for the current segment.
//!
//! The model sees fragments with whitespace runs collapsed and `&`, `<`, `>` escaped, so terms
//! are unescaped and any whitespace run in a term matches any whitespace run in the text. The
//! stored term is the text exactly as it appears in the segment.

use std::ops::Range;

use super::prompt::unescape;
use super::types::{AnnotationResult, Gloss};

/// Parse a raw service response into glosses for `segments`.
pub fn match_glosses(segments: &[String], response: &str) -> AnnotationResult {
    let entries: Vec<(String, String)> = response.lines().filter_map(parse_line).collect();
    let mut used = vec![false; entries.len()];
    let mut glosses = Vec::new();

    for (segment, content) in segments.iter().enumerate() {
        if content.trim().is_empty() {
            continue;
        }
        let mut cursor = 0;

        for (entry, (term, gloss)) in entries.iter().enumerate() {
            if used[entry] {
                continue;
            }
            if let Some(span) = find_from(content, term, cursor) {
                used[entry] = true;
                cursor = span.end;
                glosses.push(Gloss {
                    segment,
                    offset: span.start,
                    term: content[span].to_string(),
                    gloss: gloss.clone(),
                });
            } else if !segments.iter().any(|text| locate(text, term, 0).is_some()) {
                tracing::debug!(term = %term, "Dropping gloss for a term absent from the chunk");
                used[entry] = true;
            } else {
                break;
            }
        }
    }

    AnnotationResult { glosses }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim().trim_start_matches(['-', '*', '•']).trim();
    let (term, gloss) = line
        .split_once(':')
        .or_else(|| line.split_once('：'))?;
    let term = unescape(term.trim().trim_matches(['"', '`', '«', '»']).trim());
    let gloss = gloss.trim();
    if term.is_empty() || gloss.is_empty() {
        return None;
    }
    Some((term, gloss.to_string()))
}

/// Find `term` at or after `cursor`, falling back to the first occurrence.
fn find_from(content: &str, term: &str, cursor: usize) -> Option<Range<usize>> {
    locate(content, term, cursor).or_else(|| locate(content, term, 0))
}

/// Byte span of the first occurrence of `term` at or after `from`, where each whitespace run
/// in `term` stands for one or more whitespace characters in `content`.
fn locate(content: &str, term: &str, from: usize) -> Option<Range<usize>> {
    let words: Vec<&str> = term.split_whitespace().collect();
    let (first, rest) = words.split_first()?;
    let mut search = from;

    while let Some(found) = content.get(search..).and_then(|tail| tail.find(first)) {
        let start = search + found;
        let mut end = start + first.len();
        let matched = rest.iter().all(|word| {
            let tail = &content[end..];
            let trimmed = tail.trim_start();
            let gap = tail.len() - trimmed.len();
            if gap > 0 && trimmed.starts_with(word) {
                end += gap + word.len();
                true
            } else {
                false
            }
        });
        if matched {
            return Some(start..end);
        }
        search = start + content[start..].chars().next().map_or(1, char::len_utf8);
    }
    None
}
