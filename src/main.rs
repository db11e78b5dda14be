use anyhow::{Context, Result};
use bookgloss::{
    annotation::OpenAiAnnotationClient,
    config::{self, Config},
    document::{PlainTextDocument, WriteMode},
    logging,
    processing::{AnnotationPipeline, token_counter_or_whitespace},
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Annotate a plain-text book with glossary entries for its hard terms.
#[derive(Debug, Parser)]
#[command(name = "bookgloss", version, about)]
struct Cli {
    /// Plain-text book, paragraphs separated by blank lines.
    input: PathBuf,
    /// Where to write the annotated copy.
    output: PathBuf,
    /// Language the glosses are written in.
    #[arg(long)]
    target_language: Option<String>,
    /// Inline glosses (`replace`) or a gloss list after each paragraph (`append`).
    #[arg(long, value_enum)]
    write_mode: Option<WriteMode>,
    /// Directory for resumable progress; progress is kept in memory when omitted.
    #[arg(long)]
    working_path: Option<PathBuf>,
    /// Token budget per request.
    #[arg(long)]
    max_chunk_tokens: Option<usize>,
    /// Fraction by which a chunk may exceed its token budget.
    #[arg(long)]
    gap_rate: Option<f64>,
    /// Number of chunks annotated at once.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Extra rules included in every request.
    #[arg(long)]
    user_prompt: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) -> (PathBuf, PathBuf) {
        let run = &mut config.run;
        if let Some(value) = self.target_language {
            run.target_language = value;
        }
        if let Some(value) = self.write_mode {
            run.write_mode = value;
        }
        if let Some(value) = self.working_path {
            run.working_path = Some(value);
        }
        if let Some(value) = self.max_chunk_tokens {
            run.max_chunk_tokens_count = value;
        }
        if let Some(value) = self.gap_rate {
            run.gap_rate = value;
        }
        if let Some(value) = self.concurrency {
            run.max_concurrency = value;
        }
        if let Some(value) = self.user_prompt {
            run.user_prompt = Some(value);
        }
        (self.input, self.output)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = config::load_config().context("Failed to load configuration")?;
    logging::init_tracing();
    let (input, output) = cli.apply(&mut config);

    let client = OpenAiAnnotationClient::new(&config.service)
        .context("Failed to build annotation client")?;
    let counter = token_counter_or_whitespace(config.service.tokenizer_name());
    let pipeline = AnnotationPipeline::new(config.run, Arc::new(client), counter)
        .context("Failed to prepare annotation run")?;

    let document = PlainTextDocument::new(&input, &output);
    let outcome = pipeline
        .run(
            &document,
            &document,
            Box::new(|fraction| {
                tracing::info!(percent = %format!("{:.1}", fraction * 100.0), "Progress");
            }),
        )
        .await
        .with_context(|| format!("Failed to annotate {}", input.display()))?;

    tracing::info!(
        output = %output.display(),
        segments = outcome.segments,
        chunks = outcome.chunks,
        cached = outcome.metrics.chunks_cached,
        annotated = outcome.metrics.chunks_annotated,
        attempts = outcome.metrics.attempts,
        "Done"
    );
    Ok(())
}
