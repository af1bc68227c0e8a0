//! Domain error types.
//!
//! Every failure that can cross the step boundary has exactly one variant here
//! and a stable wire code. Errors are either retryable (the caller resubmits)
//! or terminal (no retry of the same request can succeed).

use thiserror::Error;
use uuid::Uuid;

/// Wire code for a missing `Idempotency-Key`.
pub const MISSING_IDEMPOTENCY_KEY: &str = "MISSING_IDEMPOTENCY_KEY";
/// Wire code for a request carrying both `choice_id` and `player_input`.
pub const INPUT_CONFLICT: &str = "INPUT_CONFLICT";
/// Wire code for an unknown choice id.
pub const INVALID_CHOICE: &str = "INVALID_CHOICE";
/// Wire code for a choice whose prerequisites are not met.
pub const CHOICE_LOCKED: &str = "CHOICE_LOCKED";
/// Wire code for a live duplicate of a pending request.
pub const REQUEST_IN_PROGRESS: &str = "REQUEST_IN_PROGRESS";
/// Wire code for an idempotency key reused with another payload.
pub const IDEMPOTENCY_KEY_REUSED: &str = "IDEMPOTENCY_KEY_REUSED";
/// Wire code for a lost optimistic version check.
pub const SESSION_STEP_CONFLICT: &str = "SESSION_STEP_CONFLICT";
/// Wire code for a step against an ended session.
pub const SESSION_NOT_ACTIVE: &str = "SESSION_NOT_ACTIVE";
/// Wire code for a failed or exhausted language model call.
pub const MODEL_UNAVAILABLE: &str = "MODEL_UNAVAILABLE";
/// Internal marker stored on idempotency records whose stream was cancelled.
pub const STREAM_ABORTED: &str = "STREAM_ABORTED";
/// Wire code for an unknown session.
pub const SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
/// Wire code for an unknown story pack.
pub const STORY_NOT_FOUND: &str = "STORY_NOT_FOUND";
/// Wire code for malformed requests and invalid story content.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Wire code for persistence and other infrastructure failures.
pub const INFRASTRUCTURE_ERROR: &str = "INFRASTRUCTURE_ERROR";

/// Top-level domain error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainError {
    /// A session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),

    /// A story pack was not found in the catalog.
    #[error("story not found: {story_id}@{version}")]
    StoryNotFound {
        /// The requested story identifier.
        story_id: String,
        /// The requested published version.
        version: i64,
    },

    /// The request did not carry an idempotency key.
    #[error("an idempotency key is required for step submission")]
    MissingIdempotencyKey,

    /// The request carried both a choice id and free-text input.
    #[error("exactly one of choice_id or player_input may be supplied")]
    InputConflict,

    /// The explicit choice does not exist on the current node.
    #[error("choice {0} is not available at the current node")]
    InvalidChoice(String),

    /// The explicit choice exists but its prerequisites are not met.
    #[error("choice {0} is locked")]
    ChoiceLocked(String),

    /// A request with the same key and payload is still executing.
    #[error("a request with idempotency key {0} is already in progress")]
    RequestInProgress(String),

    /// The idempotency key was already used with a different payload.
    #[error("idempotency key {0} was already used with a different payload")]
    IdempotencyKeyReused(String),

    /// Optimistic concurrency conflict.
    #[error(
        "step conflict on session {session_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The session that had the conflict.
        session_id: Uuid,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// The session has ended and accepts no further steps.
    #[error("session {0} is not active")]
    SessionNotActive(Uuid),

    /// The language model failed and the step was discarded.
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The consumer cancelled the stream before the final result.
    #[error("stream aborted before the final result was delivered")]
    StreamAborted,

    /// A validation error in request or story content.
    #[error("validation error: {0}")]
    Validation(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Returns the stable wire code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => SESSION_NOT_FOUND,
            Self::StoryNotFound { .. } => STORY_NOT_FOUND,
            Self::MissingIdempotencyKey => MISSING_IDEMPOTENCY_KEY,
            Self::InputConflict => INPUT_CONFLICT,
            Self::InvalidChoice(_) => INVALID_CHOICE,
            Self::ChoiceLocked(_) => CHOICE_LOCKED,
            Self::RequestInProgress(_) => REQUEST_IN_PROGRESS,
            Self::IdempotencyKeyReused(_) => IDEMPOTENCY_KEY_REUSED,
            Self::ConcurrencyConflict { .. } => SESSION_STEP_CONFLICT,
            Self::SessionNotActive(_) => SESSION_NOT_ACTIVE,
            Self::ModelUnavailable(_) => MODEL_UNAVAILABLE,
            Self::StreamAborted => STREAM_ABORTED,
            Self::Validation(_) => VALIDATION_ERROR,
            Self::Infrastructure(_) => INFRASTRUCTURE_ERROR,
        }
    }

    /// Whether resubmitting the request can succeed.
    ///
    /// In-progress and version conflicts are retryable; everything the caller
    /// must change before retrying is terminal. Infrastructure failures are
    /// treated like network failures.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestInProgress(_)
                | Self::ConcurrencyConflict { .. }
                | Self::Infrastructure(_)
                | Self::StreamAborted
        )
    }
}

/// Returns `true` when `code` names a terminal boundary error.
///
/// Used by clients that only see the wire code.
#[must_use]
pub fn is_terminal_code(code: &str) -> bool {
    matches!(
        code,
        MISSING_IDEMPOTENCY_KEY
            | INPUT_CONFLICT
            | INVALID_CHOICE
            | CHOICE_LOCKED
            | IDEMPOTENCY_KEY_REUSED
            | SESSION_NOT_ACTIVE
            | MODEL_UNAVAILABLE
            | SESSION_NOT_FOUND
            | STORY_NOT_FOUND
            | VALIDATION_ERROR
    )
}
