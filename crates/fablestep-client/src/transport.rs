//! Transport contract between the retry controller and a server.

use std::pin::Pin;

use async_trait::async_trait;
use fablestep_core::step::{StepPayload, StepResult, StepStreamEvent};
use futures::Stream;
use thiserror::Error;
use uuid::Uuid;

/// Failure of one transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response was received, or the connection dropped mid-response.
    /// The server may or may not have committed the step.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error body.
    #[error("server rejected the step ({status} {code}): {message}")]
    Server {
        /// HTTP status.
        status: u16,
        /// Wire error code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Ordered events of a streamed step as received by the client.
pub type StepEventStream =
    Pin<Box<dyn Stream<Item = Result<StepStreamEvent, TransportError>> + Send>>;

/// Sends step submissions to a server.
#[async_trait]
pub trait StepTransport: Send + Sync {
    /// Submits a step and waits for the committed result.
    async fn submit_step(
        &self,
        session_id: Uuid,
        idempotency_key: &str,
        payload: &StepPayload,
    ) -> Result<StepResult, TransportError>;

    /// Submits a step and returns its event stream. Dropping the stream
    /// cancels the step on the server if it has not committed yet.
    async fn stream_step(
        &self,
        session_id: Uuid,
        idempotency_key: &str,
        payload: &StepPayload,
    ) -> Result<StepEventStream, TransportError>;
}
