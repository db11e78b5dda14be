//! Token counting for segments.
//!
//! Prefer `tiktoken-rs` for OpenAI models and known encoding names; fall back to a whitespace
//! counter when the tokenizer cannot be resolved, so that books still chunk deterministically
//! against self-hosted models with unknown vocabularies.

use anyhow::Error as TokenizerError;
use std::sync::Arc;
use tiktoken_rs::{
    CoreBPE, cl100k_base, get_bpe_from_model, o200k_base, p50k_base, p50k_edit, r50k_base,
};

use super::types::ChunkingError;

/// Shared token counting function.
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Build a token counter for a model or encoding name.
///
/// Unknown model names first try the encoding table and then settle on `cl100k_base`.
pub fn build_token_counter(name: &str) -> Result<TokenCounter, ChunkingError> {
    let normalized = name.trim();
    let target = if normalized.is_empty() {
        "cl100k_base"
    } else {
        normalized
    };
    let encoding = resolve_encoding(target).map_err(|source| ChunkingError::Tokenizer {
        model: target.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

/// Like [`build_token_counter`], but degrade to whitespace counting when the tokenizer
/// cannot be constructed.
pub fn token_counter_or_whitespace(name: &str) -> TokenCounter {
    match build_token_counter(name) {
        Ok(counter) => counter,
        Err(error) => {
            tracing::warn!(
                model = name,
                error = %error,
                "Tokenizer unavailable; falling back to whitespace counter"
            );
            whitespace_token_counter()
        }
    }
}

fn resolve_encoding(model: &str) -> Result<CoreBPE, TokenizerError> {
    match get_bpe_from_model(model) {
        Ok(encoding) => Ok(encoding),
        Err(model_err) => {
            tracing::debug!(
                model,
                error = %model_err,
                "Tokenizer model lookup failed; trying encoding name"
            );
            if let Some(candidate) = encoding_from_name(model) {
                candidate
            } else {
                tracing::warn!(
                    model,
                    "Falling back to 'cl100k_base' encoding for token counting"
                );
                cl100k_base()
            }
        }
    }
}

fn encoding_from_name(name: &str) -> Option<Result<CoreBPE, TokenizerError>> {
    match name {
        "cl100k_base" => Some(cl100k_base()),
        "o200k_base" => Some(o200k_base()),
        "p50k_base" => Some(p50k_base()),
        "p50k_edit" => Some(p50k_edit()),
        "r50k_base" | "gpt2" => Some(r50k_base()),
        _ => None,
    }
}

/// Count whitespace-separated words; non-empty text without words counts as one token.
pub fn whitespace_token_counter() -> TokenCounter {
    Arc::new(|segment: &str| {
        let tokens = segment.split_whitespace().count();
        if tokens == 0 && !segment.is_empty() {
            1
        } else {
            tokens
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_counter_counts_words() {
        let counter = whitespace_token_counter();
        assert_eq!(counter.as_ref()("one two  three"), 3);
        assert_eq!(counter.as_ref()(""), 0);
        assert_eq!(counter.as_ref()("   "), 1);
    }

    #[test]
    fn tiktoken_counter_is_stable() {
        let counter = build_token_counter("cl100k_base").expect("encoding");
        let text = "Aujourd'hui, maman est morte. Ou peut-être hier, je ne sais pas.";
        let first = counter.as_ref()(text);
        assert!(first > 0);
        assert_eq!(first, counter.as_ref()(text));
    }

    #[test]
    fn unknown_model_falls_back_to_default_encoding() {
        let fallback = build_token_counter("some-local-model").expect("fallback encoding");
        let reference = build_token_counter("cl100k_base").expect("encoding");
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(fallback.as_ref()(text), reference.as_ref()(text));
    }
}
