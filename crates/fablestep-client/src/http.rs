//! HTTP transport against the Fablestep API.

use std::time::Duration;

use async_trait::async_trait;
use fablestep_core::step::{StepPayload, StepResult};
use futures::{StreamExt, future, stream};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::sse::EventDecoder;
use crate::transport::{StepEventStream, StepTransport, TransportError};

/// Request header carrying the idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: String,
}

/// `StepTransport` over HTTP: JSON for plain submissions, SSE for streams.
#[derive(Debug, Clone)]
pub struct HttpStepTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStepTransport {
    /// Creates a transport for the API at `base_url` (scheme, host, port).
    ///
    /// # Errors
    ///
    /// Returns the builder error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn steps_url(&self, session_id: Uuid, streaming: bool) -> String {
        let suffix = if streaming { "/stream" } else { "" };
        format!("{}/api/v1/sessions/{session_id}/steps{suffix}", self.base_url)
    }

    async fn post(
        &self,
        url: String,
        idempotency_key: &str,
        payload: &StepPayload,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(url)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(payload)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error, body.message),
            Err(_) => (String::new(), text),
        };
        Err(TransportError::Server {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

#[async_trait]
impl StepTransport for HttpStepTransport {
    async fn submit_step(
        &self,
        session_id: Uuid,
        idempotency_key: &str,
        payload: &StepPayload,
    ) -> Result<StepResult, TransportError> {
        let response = self
            .post(self.steps_url(session_id, false), idempotency_key, payload)
            .await?;
        let replayed = response
            .headers()
            .get("Idempotent-Replayed")
            .is_some_and(|v| v.as_bytes() == b"true");
        debug!(%session_id, idempotency_key, replayed, "step response received");
        response.json::<StepResult>().await.map_err(|err| {
            if err.is_decode() {
                TransportError::Protocol(err.to_string())
            } else {
                TransportError::Network(err.to_string())
            }
        })
    }

    async fn stream_step(
        &self,
        session_id: Uuid,
        idempotency_key: &str,
        payload: &StepPayload,
    ) -> Result<StepEventStream, TransportError> {
        let response = self
            .post(self.steps_url(session_id, true), idempotency_key, payload)
            .await?;
        let events = response
            .bytes_stream()
            .scan(EventDecoder::default(), |decoder, chunk| {
                let items = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(err) => vec![Err(TransportError::Network(err.to_string()))],
                };
                future::ready(Some(items))
            })
            .flat_map(stream::iter);
        Ok(Box::pin(events))
    }
}
