//! OpenAI-compatible chat-completions client.
//!
//! Works against any provider exposing `POST {base}/chat/completions` (OpenAI, vLLM, Ollama's
//! OpenAI shim, ...). HTTP outcomes are classified for the retry controller: timeouts,
//! transport errors, `408`, `429` and `5xx` are transient; `401`/`403` and other `4xx` are fatal.
//!
//! Sampling parameters configured as ranges rise with the attempt number.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::config::{SamplingRange, ServiceConfig};

use super::matcher::match_glosses;
use super::prompt::{response_budget, system_prompt, user_message};
use super::request_log::RequestLog;
use super::types::{AnnotationClient, AnnotationRequest, AnnotationResult, ServiceError};

/// Annotation client speaking the chat-completions protocol.
pub struct OpenAiAnnotationClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<SamplingRange>,
    top_p: Option<SamplingRange>,
    request_log: Option<RequestLog>,
}

impl OpenAiAnnotationClient {
    /// Build a client from service configuration. The request timeout is enforced here.
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .user_agent(concat!("bookgloss/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()
            .map_err(|error| {
                ServiceError::Configuration(format!("failed to construct HTTP client: {error}"))
            })?;

        tracing::debug!(
            url = %config.api_url,
            model = %config.model,
            timeout_secs = config.request_timeout.as_secs_f64(),
            has_api_key = config.api_key.is_some(),
            request_log_dir = ?config.request_log_dir,
            "Initialized annotation client"
        );

        Ok(Self {
            http,
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            request_log: config.request_log_dir.as_deref().and_then(RequestLog::open),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn payload(&self, request: &AnnotationRequest) -> Value {
        let mut payload = Map::new();
        payload.insert("model".into(), Value::String(self.model.clone()));
        payload.insert(
            "messages".into(),
            json!([
                {
                    "role": "system",
                    "content": system_prompt(&request.target_language),
                },
                {
                    "role": "user",
                    "content": user_message(&request.segments, request.user_prompt.as_deref()),
                },
            ]),
        );
        payload.insert(
            "max_tokens".into(),
            Value::from(response_budget(request.tokens) as u64),
        );
        let progress = request.retry_progress();
        if let Some(temperature) = self.temperature {
            payload.insert("temperature".into(), Value::from(temperature.at(progress)));
        }
        if let Some(top_p) = self.top_p {
            payload.insert("top_p".into(), Value::from(top_p.at(progress)));
        }
        Value::Object(payload)
    }

    /// Send one request and return the reply text.
    async fn complete(&self, payload: &Value) -> Result<String, ServiceError> {
        let mut builder = self.http.post(self.endpoint()).json(payload);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body: ChatResponse = response.json().await.map_err(|error| {
            if error.is_timeout() {
                ServiceError::Timeout(error.to_string())
            } else {
                ServiceError::InvalidResponse(format!("failed to decode response: {error}"))
            }
        })?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse("response contained no message".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl AnnotationClient for OpenAiAnnotationClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn settings(&self) -> Option<String> {
        if self.temperature.is_none() && self.top_p.is_none() {
            return None;
        }
        let describe = |range: Option<SamplingRange>| {
            range.map_or_else(|| "default".to_string(), |range| range.to_string())
        };
        Some(format!(
            "temperature={};top_p={}",
            describe(self.temperature),
            describe(self.top_p)
        ))
    }

    async fn annotate(
        &self,
        request: &AnnotationRequest,
    ) -> Result<AnnotationResult, ServiceError> {
        let payload = self.payload(request);
        let outcome = self.complete(&payload).await;
        if let Some(log) = &self.request_log {
            log.record(request.attempt, &payload, &outcome).await;
        }
        let content = outcome?;

        let result = match_glosses(&request.segments, &content);
        tracing::debug!(
            segments = request.segments.len(),
            glosses = result.glosses.len(),
            "Annotation response matched"
        );
        Ok(result)
    }
}

fn classify_transport(error: reqwest::Error) -> ServiceError {
    if error.is_timeout() {
        ServiceError::Timeout(error.to_string())
    } else if error.is_builder() {
        ServiceError::MalformedRequest(error.to_string())
    } else {
        ServiceError::Transport(error.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> ServiceError {
    match status {
        StatusCode::REQUEST_TIMEOUT => ServiceError::Timeout(format!("{status}: {body}")),
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ServiceError::Authentication(format!("{status}: {body}"))
        }
        status if status.is_server_error() => ServiceError::Unavailable {
            status: status.as_u16(),
            body,
        },
        status if body.to_lowercase().contains("unsupported language") => {
            ServiceError::UnsupportedLanguage(format!("{status}: {body}"))
        }
        status => ServiceError::MalformedRequest(format!("{status}: {body}")),
    }
}
