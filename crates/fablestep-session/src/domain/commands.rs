//! Commands for the Session & Step Commit context.

use fablestep_core::step::StepPayload;
use uuid::Uuid;

/// Command to start a session bound to a published story pack.
#[derive(Debug, Clone)]
pub struct StartSession {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Story to play.
    pub story_id: String,
    /// Published version of the story.
    pub story_version: i64,
}

/// Command to execute one step of a session.
#[derive(Debug, Clone)]
pub struct SubmitStep {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Session to advance.
    pub session_id: Uuid,
    /// Client-chosen idempotency key; must not be blank.
    pub idempotency_key: String,
    /// Request body.
    pub payload: StepPayload,
}
