//! Document input and output.
//!
//! The pipeline only needs an ordered list of text segments on the way in and a way to render
//! [`AnnotatedSegment`]s on the way out. [`PlainTextDocument`] implements both for
//! blank-line-separated paragraphs.

mod plain;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;
use thiserror::Error;

use crate::processing::AnnotatedSegment;

pub use plain::PlainTextDocument;

/// Errors raised while reading or writing documents.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The file could not be read or written.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path of the document.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// How glosses are laid out in the output document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum WriteMode {
    /// Glosses are written inline, right after the term they explain.
    Replace,
    /// Each paragraph is kept verbatim and followed by its gloss list.
    #[default]
    Append,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace => f.write_str("replace"),
            Self::Append => f.write_str("append"),
        }
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            other => Err(format!("unknown write mode '{other}'")),
        }
    }
}

/// Source of the text segments of a document, in reading order.
pub trait DocumentReader {
    /// Read every segment of the document.
    fn read(&self) -> Result<Vec<String>, DocumentError>;
}

/// Sink for an annotated document.
pub trait DocumentWriter {
    /// Render `segments` using `mode`.
    fn write(&self, segments: &[AnnotatedSegment], mode: WriteMode) -> Result<(), DocumentError>;
}
