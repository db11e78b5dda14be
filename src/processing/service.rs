//! Pipeline service wiring segmentation, planning, dispatch and assembly for one book.

use std::sync::Arc;

use crate::{
    annotation::{AnnotationClient, normalize_user_prompt},
    config::RunConfig,
    document::{DocumentReader, DocumentWriter},
    metrics::RunMetrics,
    processing::{
        assemble::assemble,
        chunking::{ChunkPlanner, FingerprintParams},
        dispatch::Dispatcher,
        progress::{ProgressCallback, ProgressReporter},
        segmenter::Segmenter,
        tokens::TokenCounter,
        types::{AnnotateError, AnnotatedSegment, Book, Chunk, RunOutcome},
    },
    store::{ProgressStore, open_store},
};

/// Annotates books under one validated [`RunConfig`].
///
/// The pipeline owns the progress store for its working path, so repeated runs through the
/// same value (or through pipelines opened on the same working path) only pay for chunks that
/// have not been committed yet. Construct it once per book and call [`AnnotationPipeline::run`]
/// or [`AnnotationPipeline::annotate`].
pub struct AnnotationPipeline {
    config: RunConfig,
    client: Arc<dyn AnnotationClient>,
    segmenter: Segmenter,
    planner: ChunkPlanner,
    store: Arc<dyn ProgressStore>,
}

impl AnnotationPipeline {
    /// Validate `config` and open the progress store it points at.
    pub fn new(
        config: RunConfig,
        client: Arc<dyn AnnotationClient>,
        counter: TokenCounter,
    ) -> Result<Self, AnnotateError> {
        config.validate()?;
        let store = open_store(config.working_path.as_deref())?;
        Self::with_store(config, client, counter, store)
    }

    /// Like [`AnnotationPipeline::new`], but with a caller-provided store.
    pub fn with_store(
        mut config: RunConfig,
        client: Arc<dyn AnnotationClient>,
        counter: TokenCounter,
        store: Arc<dyn ProgressStore>,
    ) -> Result<Self, AnnotateError> {
        config.validate()?;
        config.user_prompt = config.user_prompt.as_deref().and_then(normalize_user_prompt);
        let planner = ChunkPlanner::new(config.max_chunk_tokens_count, config.gap_rate);
        tracing::debug!(
            model = client.model(),
            target_language = %config.target_language,
            bound = planner.bound(),
            max_concurrency = config.max_concurrency,
            retry_times = config.retry_times,
            "Annotation pipeline ready"
        );
        Ok(Self {
            config,
            client,
            segmenter: Segmenter::new(counter),
            planner,
            store,
        })
    }

    /// Effective run options, with the user prompt normalized.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Progress store backing this pipeline.
    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Segment `texts` and plan its chunks without contacting the service.
    pub fn plan<I, S>(&self, texts: I) -> (Book, Vec<Chunk>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let book = Book::new(self.segmenter.segments(texts).collect());
        let params = FingerprintParams {
            target_language: self.config.target_language.clone(),
            model: self.client.model().to_string(),
            settings: self.client.settings(),
            user_prompt: self.config.user_prompt.clone(),
        };
        let chunks = self.planner.chunks(&book.segments, &params);
        (book, chunks)
    }

    /// Annotate `texts`, returning the segments with their glosses in document order.
    ///
    /// `progress` receives the resolved fraction of the book after every chunk; the last value
    /// is exactly `1.0`.
    pub async fn annotate<I, S>(
        &self,
        texts: I,
        progress: ProgressCallback,
    ) -> Result<(Vec<AnnotatedSegment>, RunOutcome), AnnotateError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (book, chunks) = self.plan(texts);
        tracing::info!(
            segments = book.segments.len(),
            chunks = chunks.len(),
            total_tokens = book.total_tokens,
            oversized = chunks.iter().filter(|chunk| chunk.is_oversized()).count(),
            "Planned annotation run"
        );

        let reporter = ProgressReporter::new(book.total_tokens, chunks.len(), progress);
        let metrics = Arc::new(RunMetrics::new());
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.client.clone(),
            self.config.retry_policy(),
            self.config.max_concurrency,
        )
        .with_target_language(self.config.target_language.clone())
        .with_user_prompt(self.config.user_prompt.clone())
        .with_metrics(metrics.clone());

        let resolved = dispatcher.dispatch(&chunks, &reporter).await?;
        reporter.finish();

        let segments = assemble(&book, &chunks, resolved)?;
        let outcome = RunOutcome {
            segments: book.segments.len(),
            chunks: chunks.len(),
            total_tokens: book.total_tokens,
            metrics: metrics.snapshot(),
        };
        tracing::info!(
            segments = outcome.segments,
            chunks = outcome.chunks,
            cached = outcome.metrics.chunks_cached,
            annotated = outcome.metrics.chunks_annotated,
            retries = outcome.metrics.retries(),
            "Annotation run complete"
        );
        Ok((segments, outcome))
    }

    /// Read a document, annotate it and write the annotated copy.
    pub async fn run(
        &self,
        reader: &dyn DocumentReader,
        writer: &dyn DocumentWriter,
        progress: ProgressCallback,
    ) -> Result<RunOutcome, AnnotateError> {
        let texts = reader.read()?;
        let (segments, outcome) = self.annotate(texts, progress).await?;
        writer.write(&segments, self.config.write_mode)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{AnnotationRequest, AnnotationResult, Gloss, ServiceError};
    use crate::config::ConfigError;
    use crate::processing::tokens::whitespace_token_counter;
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl AnnotationClient for EchoClient {
        fn model(&self) -> &str {
            "echo"
        }

        async fn annotate(
            &self,
            request: &AnnotationRequest,
        ) -> Result<AnnotationResult, ServiceError> {
            let glosses = request
                .segments
                .iter()
                .enumerate()
                .filter_map(|(segment, text)| {
                    let term = text.split_whitespace().next()?;
                    Some(Gloss {
                        segment,
                        offset: text.find(term)?,
                        term: term.to_string(),
                        gloss: term.to_uppercase(),
                    })
                })
                .collect();
            Ok(AnnotationResult { glosses })
        }
    }

    fn pipeline(config: RunConfig) -> Result<AnnotationPipeline, AnnotateError> {
        AnnotationPipeline::new(config, Arc::new(EchoClient), whitespace_token_counter())
    }

    #[test]
    fn rejects_invalid_options_before_any_work() {
        let config = RunConfig {
            gap_rate: 1.5,
            ..RunConfig::default()
        };
        assert!(matches!(
            pipeline(config),
            Err(AnnotateError::Config(ConfigError::InvalidOption { option: "gap_rate", .. }))
        ));
    }

    #[test]
    fn normalizes_the_user_prompt() {
        let config = RunConfig {
            user_prompt: Some("  \n \n".into()),
            ..RunConfig::default()
        };
        assert_eq!(pipeline(config).unwrap().config().user_prompt, None);
    }

    #[test]
    fn user_prompt_changes_fingerprints() {
        let plain = pipeline(RunConfig::default()).unwrap();
        let prompted = pipeline(RunConfig {
            user_prompt: Some("Only gloss nouns.".into()),
            ..RunConfig::default()
        })
        .unwrap();

        let (_, a) = plain.plan(["un deux trois"]);
        let (_, b) = prompted.plan(["un deux trois"]);
        assert_ne!(a[0].fingerprint, b[0].fingerprint);
    }

    #[test]
    fn sampling_settings_change_fingerprints() {
        use crate::annotation::OpenAiAnnotationClient;
        use crate::config::{SamplingRange, ServiceConfig};

        let plan_with = |temperature: f64| {
            let client = OpenAiAnnotationClient::new(&ServiceConfig {
                api_url: "http://localhost".into(),
                api_key: None,
                model: "gpt-4o-mini".into(),
                token_encoding: None,
                request_timeout: std::time::Duration::from_secs(1),
                temperature: Some(SamplingRange::fixed(temperature)),
                top_p: None,
                request_log_dir: None,
            })
            .unwrap();
            let pipeline = AnnotationPipeline::new(
                RunConfig::default(),
                Arc::new(client),
                whitespace_token_counter(),
            )
            .unwrap();
            let (_, chunks) = pipeline.plan(["un deux trois"]);
            chunks[0].fingerprint.clone()
        };

        assert_eq!(plan_with(0.2), plan_with(0.2));
        assert_ne!(plan_with(0.2), plan_with(0.9));
    }

    #[tokio::test]
    async fn annotates_in_document_order() {
        let pipeline = pipeline(RunConfig {
            max_chunk_tokens_count: 4,
            gap_rate: 0.0,
            max_concurrency: 3,
            ..RunConfig::default()
        })
        .unwrap();

        let (segments, outcome) = pipeline
            .annotate(
                ["alpha beta", "gamma delta", "epsilon zeta eta"],
                Box::new(|_| {}),
            )
            .await
            .unwrap();

        assert_eq!(outcome.segments, 3);
        assert_eq!(outcome.chunks, 2);
        let terms: Vec<(usize, &str)> = segments
            .iter()
            .flat_map(|s| s.glosses.iter().map(|g| (g.segment, g.term.as_str())))
            .collect();
        assert_eq!(terms, vec![(0, "alpha"), (1, "gamma"), (2, "epsilon")]);
    }

    #[tokio::test]
    async fn empty_book_reports_completion() {
        let pipeline = pipeline(RunConfig::default()).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();

        let (segments, outcome) = pipeline
            .annotate(Vec::<String>::new(), Box::new(move |v| sink.lock().unwrap().push(v)))
            .await
            .unwrap();

        assert!(segments.is_empty());
        assert_eq!(outcome.chunks, 0);
        assert_eq!(seen.lock().unwrap().clone(), vec![1.0]);
    }
}
