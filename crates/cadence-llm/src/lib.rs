//! Language-model capability for the cadence engine.
//!
//! One operation: generate a JSON object conforming to a declared schema.
//! [`OpenAiModel`] is the production client for any OpenAI-compatible
//! chat-completions endpoint; engine code depends only on [`LanguageModel`].

pub mod error;
pub mod schema;

pub use error::{ModelError, ModelResult};
pub use schema::StructuredOutput;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Inputs for one structured-output generation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system: String,
    pub user: String,
    pub schema_name: String,
    pub schema: serde_json::Value,
    pub temperature: f32,
    /// Provider-call retries on transient failure (rate limit, network).
    pub max_retries: u32,
}

/// Token usage reported by the provider for a single call.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
}

/// Result of a structured-output generation.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// The parsed JSON object. Schema conformance is the provider's job;
    /// callers still deserialize and semantically validate.
    pub value: serde_json::Value,
    pub usage: Usage,
}

/// A model that can produce schema-conformant JSON objects.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> ModelResult<GenerateResponse>;

    /// Identifier for logs and stats.
    fn model_id(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible client
// ---------------------------------------------------------------------------

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for an OpenAI-compatible `/chat/completions` endpoint using the
/// `json_schema` response format.
#[derive(Clone)]
pub struct OpenAiModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    /// Point the client at a different base URL (proxy, gateway, test).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn attempt(&self, request: &GenerateRequest) -> ModelResult<GenerateResponse> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": request.temperature,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true,
                },
            },
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        parse_completion(&text)
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn generate(&self, request: &GenerateRequest) -> ModelResult<GenerateResponse> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(request).await {
                Ok(response) => {
                    debug!(
                        model = %self.model,
                        schema = %request.schema_name,
                        total_tokens = response.usage.total_tokens,
                        "structured generation succeeded"
                    );
                    return Ok(response);
                }
                Err(err) if err.is_transient() && attempt < request.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        model = %self.model,
                        attempt = attempt + 1,
                        error = %err,
                        "transient model failure, retrying after {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

fn classify_transport(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        ModelError::Network(err.to_string())
    } else {
        ModelError::Unknown(err.to_string())
    }
}

/// Map a non-success provider status to an error category.
fn classify_status(status: StatusCode, body: &str) -> ModelError {
    let message = format!("provider returned {}: {}", status.as_u16(), body);
    match status.as_u16() {
        401 | 403 => ModelError::Auth(message),
        408 => ModelError::Timeout(message),
        429 => ModelError::RateLimit(message),
        500..=599 => ModelError::Network(message),
        _ => ModelError::Unknown(message),
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    choices: Vec<CompletionChoice>,
    usage: Option<RawUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Deserialize)]
struct RawUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Default)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

#[derive(Deserialize, Default)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

/// Parse a chat-completions body into the generated object plus usage.
fn parse_completion(body: &str) -> ModelResult<GenerateResponse> {
    let completion: CompletionBody = serde_json::from_str(body)
        .map_err(|e| ModelError::SchemaParse(format!("malformed completion body: {e}")))?;

    let content = completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| ModelError::SchemaParse("completion contained no choices".into()))?;

    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| ModelError::SchemaParse(format!("completion content is not JSON: {e}")))?;

    let usage = completion
        .usage
        .map(|raw| Usage {
            prompt_tokens: raw.prompt_tokens,
            completion_tokens: raw.completion_tokens,
            total_tokens: raw.total_tokens,
            reasoning_tokens: raw
                .completion_tokens_details
                .unwrap_or_default()
                .reasoning_tokens,
            cached_tokens: raw.prompt_tokens_details.unwrap_or_default().cached_tokens,
        })
        .unwrap_or_default();

    Ok(GenerateResponse { value, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_completion_extracts_object_and_usage() {
        let body = r#"{
            "choices": [{"message": {"content": "{\"ok\": true}"}}],
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 20,
                "total_tokens": 120,
                "completion_tokens_details": {"reasoning_tokens": 5},
                "prompt_tokens_details": {"cached_tokens": 50}
            }
        }"#;
        let response = parse_completion(body).unwrap();
        assert_eq!(response.value["ok"], true);
        assert_eq!(response.usage.total_tokens, 120);
        assert_eq!(response.usage.reasoning_tokens, 5);
        assert_eq!(response.usage.cached_tokens, 50);
    }

    #[test]
    fn parse_completion_without_usage_defaults_to_zero() {
        let body = r#"{"choices": [{"message": {"content": "{}"}}]}"#;
        let response = parse_completion(body).unwrap();
        assert_eq!(response.usage.total_tokens, 0);
    }

    #[test]
    fn non_json_content_is_a_schema_parse_error() {
        let body = r#"{"choices": [{"message": {"content": "not json"}}]}"#;
        let err = parse_completion(body).unwrap_err();
        assert_eq!(err.category(), "schema_parse_error");
    }

    #[test]
    fn empty_choices_is_a_schema_parse_error() {
        let body = r#"{"choices": []}"#;
        let err = parse_completion(body).unwrap_err();
        assert_eq!(err.category(), "schema_parse_error");
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, "").category(),
            "auth_error"
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "").category(),
            "rate_limit"
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT, "").category(),
            "timeout"
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, "").category(),
            "network"
        );
        assert_eq!(
            classify_status(StatusCode::IM_A_TEAPOT, "").category(),
            "unknown"
        );
    }
}
