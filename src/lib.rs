#![deny(missing_docs)]

//! Core library for bookgloss: resumable, concurrent glossary annotation of book text.

/// Annotation service abstraction and the OpenAI-compatible client.
pub mod annotation;
/// Environment-driven configuration management.
pub mod config;
/// Document readers and writers.
pub mod document;
/// Structured logging and tracing setup.
pub mod logging;
/// Run metrics helpers.
pub mod metrics;
/// Segmentation, chunking, dispatch and assembly.
pub mod processing;
/// Resumable per-chunk progress storage.
pub mod store;
