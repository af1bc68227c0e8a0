//! HTTP client for OpenAI-compatible chat completions.

use async_trait::async_trait;
use fablestep_narrative::domain::mapper::{IntentMapper, IntentMapping, MappingRequest};
use fablestep_narrative::domain::model::{
    EMPTY_OUTPUT, MALFORMED_OUTPUT, ModelFailure, ModelOutcome, TRANSPORT_ERROR, UPSTREAM_REJECTED,
};
use fablestep_narrative::domain::narrator::{
    EpilogueRequest, NarrationRequest, NarrationStream, Narrator,
};
use futures::{StreamExt, future, stream};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::LlmConfig;
use crate::prompt::{self, ChatMessage};
use crate::sse::SseBuffer;

/// Errors raised while constructing the client.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions adapter implementing both model contracts.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl std::fmt::Debug for ChatCompletionsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsClient {
    /// Creates a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Client` if the TLS backend cannot be initialised.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(std::time::Duration::from_secs(10)))
            .build()?;
        Ok(Self { http, config })
    }

    async fn send(&self, body: &ChatRequest<'_>) -> ModelOutcome<reqwest::Response> {
        let mut request = self.http.post(self.config.completions_url()).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "chat completion request failed");
                return ModelOutcome::RetryableFailure(ModelFailure::new(
                    TRANSPORT_ERROR,
                    err.to_string(),
                ));
            }
        };
        let status = response.status();
        if status.is_success() {
            return ModelOutcome::Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        warn!(%status, "chat completion request rejected");
        status_failure(status, message)
    }

    async fn complete(&self, body: &ChatRequest<'_>) -> ModelOutcome<String> {
        let response = match self.send(body).await {
            ModelOutcome::Ok(response) => response,
            ModelOutcome::RetryableFailure(failure) => {
                return ModelOutcome::RetryableFailure(failure);
            }
            ModelOutcome::FatalFailure(failure) => return ModelOutcome::FatalFailure(failure),
        };
        let parsed = match response.json::<ChatResponse>().await {
            Ok(parsed) => parsed,
            Err(err) if err.is_decode() => {
                return ModelOutcome::RetryableFailure(ModelFailure::new(
                    MALFORMED_OUTPUT,
                    format!("unparsable completion: {err}"),
                ));
            }
            Err(err) => {
                return ModelOutcome::RetryableFailure(ModelFailure::new(
                    TRANSPORT_ERROR,
                    err.to_string(),
                ));
            }
        };
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return ModelOutcome::RetryableFailure(ModelFailure::new(
                EMPTY_OUTPUT,
                "completion had no content",
            ));
        }
        ModelOutcome::Ok(content)
    }
}

/// Maps a non-success status to a classified failure. Throttling, request
/// timeouts and server errors are retryable; every other status is a refusal.
fn status_failure<T>(status: StatusCode, message: String) -> ModelOutcome<T> {
    let detail = if message.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {message}")
    };
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ModelOutcome::RetryableFailure(ModelFailure::new(TRANSPORT_ERROR, detail))
    } else {
        ModelOutcome::FatalFailure(ModelFailure::new(UPSTREAM_REJECTED, detail))
    }
}

/// Parses the mapper's answer. Code fences and prose around the JSON object
/// are tolerated.
fn parse_mapping(content: &str) -> Result<IntentMapping, ModelFailure> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => {
            return Err(ModelFailure::new(
                MALFORMED_OUTPUT,
                "mapping answer contains no JSON object",
            ));
        }
    };
    serde_json::from_str(json).map_err(|err| {
        ModelFailure::new(MALFORMED_OUTPUT, format!("unparsable mapping: {err}"))
    })
}

#[async_trait]
impl IntentMapper for ChatCompletionsClient {
    #[instrument(skip_all, fields(node_id = %request.node_id, attempt = request.attempt))]
    async fn map_intent(&self, request: &MappingRequest) -> ModelOutcome<IntentMapping> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: prompt::mapping_messages(request),
            stream: false,
            temperature: 0.0,
            max_tokens: Some(200),
            response_format: Some(serde_json::json!({ "type": "json_object" })),
        };
        match self.complete(&body).await {
            ModelOutcome::Ok(content) => match parse_mapping(&content) {
                Ok(mapping) => {
                    debug!(
                        target_id = %mapping.target_id,
                        confidence = mapping.confidence,
                        "intent mapped"
                    );
                    ModelOutcome::Ok(mapping)
                }
                Err(failure) => ModelOutcome::RetryableFailure(failure),
            },
            ModelOutcome::RetryableFailure(failure) => ModelOutcome::RetryableFailure(failure),
            ModelOutcome::FatalFailure(failure) => ModelOutcome::FatalFailure(failure),
        }
    }
}

#[async_trait]
impl Narrator for ChatCompletionsClient {
    #[instrument(skip_all)]
    async fn narrate(&self, request: &NarrationRequest) -> ModelOutcome<NarrationStream> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: prompt::narration_messages(request),
            stream: true,
            temperature: 0.8,
            max_tokens: Some(self.config.max_tokens),
            response_format: None,
        };
        let response = match self.send(&body).await {
            ModelOutcome::Ok(response) => response,
            ModelOutcome::RetryableFailure(failure) => {
                return ModelOutcome::RetryableFailure(failure);
            }
            ModelOutcome::FatalFailure(failure) => return ModelOutcome::FatalFailure(failure),
        };
        // `None` marks the end of the body so a missing `[DONE]` surfaces.
        let deltas = response
            .bytes_stream()
            .map(Some)
            .chain(stream::once(future::ready(None)))
            .scan(SseBuffer::default(), |buffer, chunk| {
                if buffer.is_done() {
                    return future::ready(None);
                }
                let items = match chunk {
                    Some(Ok(bytes)) => buffer.push(&bytes),
                    Some(Err(err)) => {
                        vec![Err(ModelFailure::new(TRANSPORT_ERROR, err.to_string()))]
                    }
                    None => buffer.end().map(Err).into_iter().collect(),
                };
                future::ready(Some(items))
            })
            .flat_map(stream::iter);
        ModelOutcome::Ok(Box::pin(deltas))
    }

    #[instrument(skip_all, fields(ending = %request.ending_title))]
    async fn epilogue(&self, request: &EpilogueRequest) -> ModelOutcome<String> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: prompt::epilogue_messages(request),
            stream: false,
            temperature: 0.8,
            max_tokens: Some(self.config.max_tokens),
            response_format: None,
        };
        self.complete(&body).await
    }
}

#[cfg(test)]
mod tests {
    use fablestep_narrative::domain::mapper::MappedTargetType;

    use super::*;

    #[test]
    fn test_parse_mapping_accepts_fenced_json() {
        let content = "```json\n{\"target_type\":\"intent\",\"target_id\":\"plead\",\
                       \"confidence\":0.8,\"intensity_tier\":1}\n```";

        let mapping = parse_mapping(content).unwrap();

        assert_eq!(mapping.target_type, MappedTargetType::Intent);
        assert_eq!(mapping.target_id, "plead");
        assert_eq!(mapping.intensity_tier, 1);
        assert!(!mapping.policy_flagged);
    }

    #[test]
    fn test_parse_mapping_rejects_prose() {
        let failure = parse_mapping("I think the player wants to knock.").unwrap_err();

        assert_eq!(failure.code, MALFORMED_OUTPUT);
    }

    #[test]
    fn test_parse_mapping_rejects_wrong_shape() {
        let failure = parse_mapping("{\"target\": \"knock\"}").unwrap_err();

        assert_eq!(failure.code, MALFORMED_OUTPUT);
    }

    #[test]
    fn test_throttling_and_server_errors_are_retryable() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let outcome: ModelOutcome<()> = status_failure(status, String::new());
            assert!(
                matches!(
                    outcome,
                    ModelOutcome::RetryableFailure(ref f) if f.code == TRANSPORT_ERROR
                ),
                "{status} should be retryable"
            );
        }
    }

    #[test]
    fn test_client_errors_are_fatal() {
        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let outcome: ModelOutcome<()> = status_failure(status, "nope".into());
            assert!(
                matches!(
                    outcome,
                    ModelOutcome::FatalFailure(ref f)
                        if f.code == UPSTREAM_REJECTED && f.message.contains("nope")
                ),
                "{status} should be fatal"
            );
        }
    }
}
