//! Turn document text into position-stable segments with token counts.

use super::{tokens::TokenCounter, types::Segment};

/// Produces [`Segment`]s under a fixed token counter.
#[derive(Clone)]
pub struct Segmenter {
    counter: TokenCounter,
}

impl Segmenter {
    /// Create a segmenter backed by the given counter.
    pub fn new(counter: TokenCounter) -> Self {
        Self { counter }
    }

    /// Lazily number and measure texts in the order they are yielded.
    ///
    /// Blank texts are kept so that positions line up with the document reader's output.
    pub fn segments<I, S>(&self, texts: I) -> impl Iterator<Item = Segment>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        texts
            .into_iter()
            .enumerate()
            .map(move |(index, text)| self.segment(index, text.into()))
    }

    /// Measure a single text at the given position.
    pub fn segment(&self, index: usize, content: String) -> Segment {
        let tokens = self.counter.as_ref()(&content);
        Segment {
            index,
            content,
            tokens,
        }
    }
}

/// Split raw text into paragraphs separated by blank lines.
///
/// Lines inside a paragraph are joined with a single newline; surrounding whitespace is
/// trimmed and empty paragraphs are dropped.
pub fn split_paragraphs(raw: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(trimmed);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::tokens::whitespace_token_counter;

    #[test]
    fn segments_are_numbered_in_order() {
        let segmenter = Segmenter::new(whitespace_token_counter());
        let segments: Vec<_> = segmenter
            .segments(vec!["un deux", "", "trois quatre cinq"])
            .collect();

        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            segments.iter().map(|s| s.tokens).collect::<Vec<_>>(),
            vec![2, 0, 3]
        );
        assert!(segments[1].is_blank());
    }

    #[test]
    fn split_paragraphs_handles_blank_runs() {
        let raw = "  Première ligne\nsuite\n\n\n\nDeuxième   \n\n";
        assert_eq!(
            split_paragraphs(raw),
            vec!["Première ligne\nsuite".to_string(), "Deuxième".to_string()]
        );
    }

    #[test]
    fn split_paragraphs_of_empty_text_is_empty() {
        assert!(split_paragraphs("\n  \n").is_empty());
    }
}
