use crate::document::WriteMode;
use crate::processing::retry::RetryPolicy;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TARGET_LANGUAGE: &str = "English";
const DEFAULT_MAX_CHUNK_TOKENS: usize = 3000;
const DEFAULT_GAP_RATE: f64 = 0.15;
const DEFAULT_RETRY_TIMES: u32 = 5;
const DEFAULT_RETRY_INTERVAL_SECS: f64 = 6.0;
const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 120.0;

/// Errors encountered while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
    /// A run option is outside of its accepted range.
    #[error("Invalid option `{option}`: {reason}")]
    InvalidOption {
        /// Name of the rejected option.
        option: &'static str,
        /// Human readable explanation of the accepted range.
        reason: String,
    },
}

/// Full configuration for the `bookgloss` binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Settings handed to the annotation service client.
    pub service: ServiceConfig,
    /// Options consumed by the annotation pipeline.
    pub run: RunConfig,
}

/// Annotation service settings, passed through to the HTTP client untouched.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base URL of an OpenAI-compatible API (for example `https://api.openai.com/v1`).
    pub api_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Model identifier sent with every request. Part of the chunk fingerprint.
    pub model: String,
    /// Tokenizer model or encoding name; defaults to the model itself.
    pub token_encoding: Option<String>,
    /// Per-request timeout enforced by the HTTP client.
    pub request_timeout: Duration,
    /// Optional sampling temperature, raised across retries when given as a range.
    pub temperature: Option<SamplingRange>,
    /// Optional nucleus sampling parameter, raised across retries when given as a range.
    pub top_p: Option<SamplingRange>,
    /// Directory receiving one transcript file per request; disabled when absent.
    pub request_log_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Name handed to the tokenizer lookup.
    pub fn tokenizer_name(&self) -> &str {
        self.token_encoding.as_deref().unwrap_or(&self.model)
    }
}

/// A sampling parameter that starts at `low` on the first attempt and reaches `high` on the
/// last one.
///
/// Parsed from a single number (`0.7`) or a range (`0.2..0.9` or `0.2,0.9`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingRange {
    /// Value used on the first attempt.
    pub low: f64,
    /// Value used on the last attempt.
    pub high: f64,
}

impl SamplingRange {
    /// The same value on every attempt.
    pub fn fixed(value: f64) -> Self {
        Self {
            low: value,
            high: value,
        }
    }

    /// Value at `progress` through the retry budget, `0.0` being the first attempt.
    pub fn at(&self, progress: f64) -> f64 {
        if self.low == self.high {
            return self.low;
        }
        self.low + (self.high - self.low) * progress.clamp(0.0, 1.0)
    }
}

impl fmt::Display for SamplingRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}..{}", self.low, self.high)
        }
    }
}

impl FromStr for SamplingRange {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<f64>()
                .ok()
                .filter(|number| number.is_finite())
                .ok_or_else(|| format!("`{part}` is not a finite number"))
        };
        let range = match value.split_once("..").or_else(|| value.split_once(',')) {
            Some((low, high)) => Self {
                low: parse(low)?,
                high: parse(high)?,
            },
            None => Self::fixed(parse(value)?),
        };
        if range.low > range.high {
            return Err(format!("range `{value}` decreases"));
        }
        Ok(range)
    }
}

/// Options for one annotation run.
///
/// Every recognized option is enumerated here:
///
/// - `target_language`: language the glosses are written in; part of the fingerprint.
/// - `write_mode`: replace the text in place or lay glosses out next to the original.
/// - `max_chunk_tokens_count`: token budget per chunk, must be positive.
/// - `gap_rate`: fractional overshoot tolerated past the budget, in `[0, 1)`.
/// - `working_path`: directory that persists chunk progress; in memory when absent.
/// - `user_prompt`: extra rules injected into every request; part of the fingerprint.
/// - `max_concurrency`: number of chunks in flight at once, must be positive.
/// - `retry_times`: attempts per chunk before giving up, must be positive.
/// - `retry_interval`: fixed wait between attempts after a transient failure.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Language the glosses are written in.
    pub target_language: String,
    /// Output layout selector.
    pub write_mode: WriteMode,
    /// Token budget per chunk.
    pub max_chunk_tokens_count: usize,
    /// Fractional overshoot tolerance for the chunk budget.
    pub gap_rate: f64,
    /// Optional persistence location for chunk progress.
    pub working_path: Option<PathBuf>,
    /// Optional rules injected into every request.
    pub user_prompt: Option<String>,
    /// Maximum number of in-flight chunks.
    pub max_concurrency: usize,
    /// Maximum attempts per chunk.
    pub retry_times: u32,
    /// Backoff between attempts.
    pub retry_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_language: DEFAULT_TARGET_LANGUAGE.to_string(),
            write_mode: WriteMode::Append,
            max_chunk_tokens_count: DEFAULT_MAX_CHUNK_TOKENS,
            gap_rate: DEFAULT_GAP_RATE,
            working_path: None,
            user_prompt: None,
            max_concurrency: 1,
            retry_times: DEFAULT_RETRY_TIMES,
            retry_interval: Duration::from_secs_f64(DEFAULT_RETRY_INTERVAL_SECS),
        }
    }
}

impl RunConfig {
    /// Reject impossible budgets before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_tokens_count == 0 {
            return Err(ConfigError::InvalidOption {
                option: "max_chunk_tokens_count",
                reason: "must be a positive integer".into(),
            });
        }
        if !self.gap_rate.is_finite() || !(0.0..1.0).contains(&self.gap_rate) {
            return Err(ConfigError::InvalidOption {
                option: "gap_rate",
                reason: format!("must be within [0, 1), got {}", self.gap_rate),
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidOption {
                option: "max_concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.retry_times == 0 {
            return Err(ConfigError::InvalidOption {
                option: "retry_times",
                reason: "must be at least 1".into(),
            });
        }
        if self.target_language.trim().is_empty() {
            return Err(ConfigError::InvalidOption {
                option: "target_language",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Retry policy derived from `retry_times` and `retry_interval`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_times, self.retry_interval)
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let service = ServiceConfig {
            api_url: load_env("ANNOTATION_API_URL")?,
            api_key: load_env_optional("ANNOTATION_API_KEY"),
            model: load_env("ANNOTATION_MODEL")?,
            token_encoding: load_env_optional("TOKEN_ENCODING"),
            request_timeout: Duration::from_secs_f64(
                parse_env_optional("REQUEST_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            temperature: parse_env_optional("ANNOTATION_TEMPERATURE")?,
            top_p: parse_env_optional("ANNOTATION_TOP_P")?,
            request_log_dir: load_env_optional("ANNOTATION_LOG_DIR").map(PathBuf::from),
        };

        let defaults = RunConfig::default();
        let run = RunConfig {
            target_language: load_env_optional("TARGET_LANGUAGE")
                .unwrap_or(defaults.target_language),
            write_mode: parse_env_optional("WRITE_MODE")?.unwrap_or(defaults.write_mode),
            max_chunk_tokens_count: parse_env_optional("MAX_CHUNK_TOKENS")?
                .unwrap_or(defaults.max_chunk_tokens_count),
            gap_rate: parse_env_optional("GAP_RATE")?.unwrap_or(defaults.gap_rate),
            working_path: load_env_optional("WORKING_PATH").map(PathBuf::from),
            user_prompt: load_env_optional("USER_PROMPT"),
            max_concurrency: parse_env_optional("MAX_CONCURRENCY")?
                .unwrap_or(defaults.max_concurrency),
            retry_times: parse_env_optional("RETRY_TIMES")?.unwrap_or(defaults.retry_times),
            retry_interval: parse_env_optional::<f64>("RETRY_INTERVAL_SECS")?
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.retry_interval),
        };

        Ok(Self { service, run })
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

/// Load `.env` (when present) and read configuration from the environment.
pub fn load_config() -> Result<Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        api_url = %config.service.api_url,
        model = %config.service.model,
        target_language = %config.run.target_language,
        max_chunk_tokens = config.run.max_chunk_tokens_count,
        gap_rate = config.run.gap_rate,
        working_path = ?config.run.working_path,
        "Loaded configuration"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_run_config_is_valid() {
        RunConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_zero_token_budget() {
        let config = RunConfig {
            max_chunk_tokens_count: 0,
            ..RunConfig::default()
        };
        let error = config.validate().unwrap_err();
        assert!(matches!(
            error,
            ConfigError::InvalidOption {
                option: "max_chunk_tokens_count",
                ..
            }
        ));
    }

    #[test]
    fn rejects_gap_rate_outside_unit_interval() {
        for gap_rate in [-0.1, 1.0, 1.5, f64::NAN] {
            let config = RunConfig {
                gap_rate,
                ..RunConfig::default()
            };
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::InvalidOption {
                        option: "gap_rate",
                        ..
                    })
                ),
                "gap_rate {gap_rate} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_zero_concurrency_and_retries() {
        let config = RunConfig {
            max_concurrency: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            retry_times: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tokenizer_name_prefers_explicit_encoding() {
        let mut service = ServiceConfig {
            api_url: "http://localhost".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            token_encoding: None,
            request_timeout: Duration::from_secs(1),
            temperature: None,
            top_p: None,
            request_log_dir: None,
        };
        assert_eq!(service.tokenizer_name(), "gpt-4o-mini");
        service.token_encoding = Some("cl100k_base".into());
        assert_eq!(service.tokenizer_name(), "cl100k_base");
    }

    #[test]
    fn sampling_accepts_a_value_or_a_range() {
        assert_eq!("0.7".parse::<SamplingRange>(), Ok(SamplingRange::fixed(0.7)));
        assert_eq!(
            "0.2..0.9".parse::<SamplingRange>(),
            Ok(SamplingRange {
                low: 0.2,
                high: 0.9
            })
        );
        assert_eq!(
            " 0.2 , 0.9 ".parse::<SamplingRange>(),
            Ok(SamplingRange {
                low: 0.2,
                high: 0.9
            })
        );
        assert!("0.9..0.2".parse::<SamplingRange>().is_err());
        assert!("hot".parse::<SamplingRange>().is_err());
        assert!("0.2..inf".parse::<SamplingRange>().is_err());
    }

    #[test]
    fn sampling_rises_across_the_retry_budget() {
        let range = SamplingRange {
            low: 0.0,
            high: 1.0,
        };
        assert_eq!(range.at(0.0), 0.0);
        assert_eq!(range.at(0.5), 0.5);
        assert_eq!(range.at(1.0), 1.0);
        assert_eq!(range.at(3.0), 1.0);
        assert_eq!(SamplingRange::fixed(0.3).at(0.8), 0.3);
        assert_eq!(range.to_string(), "0..1");
        assert_eq!(SamplingRange::fixed(0.3).to_string(), "0.3");
    }
}
