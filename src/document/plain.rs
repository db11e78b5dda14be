use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::annotation::Gloss;
use crate::processing::{AnnotatedSegment, split_paragraphs};

use super::{DocumentError, DocumentReader, DocumentWriter, WriteMode};

/// Plain-text document: paragraphs separated by blank lines.
#[derive(Debug, Clone)]
pub struct PlainTextDocument {
    input: PathBuf,
    output: PathBuf,
}

impl PlainTextDocument {
    /// Read from `input`, write the annotated copy to `output`.
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Path the document is read from.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Path the annotated copy is written to.
    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl DocumentReader for PlainTextDocument {
    fn read(&self) -> Result<Vec<String>, DocumentError> {
        let raw = fs::read_to_string(&self.input).map_err(|source| DocumentError::Io {
            path: self.input.clone(),
            source,
        })?;
        let paragraphs = split_paragraphs(&raw);
        tracing::debug!(
            path = %self.input.display(),
            paragraphs = paragraphs.len(),
            "Read plain-text document"
        );
        Ok(paragraphs)
    }
}

impl DocumentWriter for PlainTextDocument {
    fn write(&self, segments: &[AnnotatedSegment], mode: WriteMode) -> Result<(), DocumentError> {
        let rendered = render(segments, mode);
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| DocumentError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.output, rendered).map_err(|source| DocumentError::Io {
            path: self.output.clone(),
            source,
        })?;
        tracing::info!(
            path = %self.output.display(),
            segments = segments.len(),
            mode = %mode,
            "Wrote annotated document"
        );
        Ok(())
    }
}

/// Render annotated paragraphs as text.
pub(crate) fn render(segments: &[AnnotatedSegment], mode: WriteMode) -> String {
    let paragraphs: Vec<String> = segments
        .iter()
        .map(|annotated| match mode {
            WriteMode::Replace => render_inline(&annotated.segment.content, &annotated.glosses),
            WriteMode::Append => render_appended(&annotated.segment.content, &annotated.glosses),
        })
        .collect();
    let mut out = paragraphs.join("\n\n");
    out.push('\n');
    out
}

fn render_inline(content: &str, glosses: &[Gloss]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for gloss in glosses {
        let end = gloss.offset.checked_add(gloss.term.len());
        let Some(end) = end.filter(|&end| {
            gloss.offset >= cursor && content.get(gloss.offset..end) == Some(gloss.term.as_str())
        }) else {
            tracing::debug!(term = %gloss.term, offset = gloss.offset, "Skipping misplaced gloss");
            continue;
        };
        out.push_str(&content[cursor..end]);
        let _ = write!(out, " ({})", gloss.gloss);
        cursor = end;
    }
    out.push_str(&content[cursor..]);
    out
}

fn render_appended(content: &str, glosses: &[Gloss]) -> String {
    let mut out = content.to_string();
    for gloss in glosses {
        let _ = write!(out, "\n  {}: {}", gloss.term, gloss.gloss);
    }
    out
}
