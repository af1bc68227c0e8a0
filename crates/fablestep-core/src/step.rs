//! Step wire types shared by the server pipeline and its clients.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::DomainError;
use crate::repository::SessionStatus;

/// Request body of a step submission.
///
/// At most one of the two fields may be present; neither means "no input".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPayload {
    /// Explicit visible choice at the current node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice_id: Option<String>,
    /// Free-text player input to be mapped by the intent mapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_input: Option<String>,
}

/// The three accepted input shapes of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepInput {
    /// No input: the fallback target executes directly.
    None,
    /// An explicit choice id.
    Choice(String),
    /// Raw free text, not yet normalized.
    FreeText(String),
}

impl StepPayload {
    /// Payload selecting an explicit choice.
    #[must_use]
    pub fn choice(choice_id: impl Into<String>) -> Self {
        Self {
            choice_id: Some(choice_id.into()),
            player_input: None,
        }
    }

    /// Payload carrying free text.
    #[must_use]
    pub fn free_text(text: impl Into<String>) -> Self {
        Self {
            choice_id: None,
            player_input: Some(text.into()),
        }
    }

    /// Classifies the payload into its input shape.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InputConflict` if both fields are present.
    pub fn input(&self) -> Result<StepInput, DomainError> {
        match (&self.choice_id, &self.player_input) {
            (Some(_), Some(_)) => Err(DomainError::InputConflict),
            (Some(choice), None) => Ok(StepInput::Choice(choice.clone())),
            (None, Some(text)) => Ok(StepInput::FreeText(text.clone())),
            (None, None) => Ok(StepInput::None),
        }
    }

    /// SHA-256 fingerprint of the payload, hex encoded.
    ///
    /// Absent and present fields hash differently, so `{}` and
    /// `{"player_input": ""}` never collide.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [&self.choice_id, &self.player_input] {
            match field {
                Some(value) => {
                    hasher.update([1_u8]);
                    hasher.update((value.len() as u64).to_le_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0_u8]),
            }
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Whether a step executed a visible choice or a fallback executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A visible choice of the current node.
    Visible,
    /// A pack-level fallback executor.
    Fallback,
}

/// The executable target a step input resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    /// Visible choice or fallback executor.
    pub kind: TargetKind,
    /// Choice or executor id.
    pub id: String,
    /// Effect magnitude tier in `[-2, 2]`.
    pub intensity_tier: i8,
}

/// How the router disposed of the selected target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDisposition {
    /// The selected target executed.
    Executed,
    /// The selected target was blocked and its fallback executed instead.
    Rerouted,
    /// Both the target and its fallback were blocked; nothing changed.
    Degraded,
}

/// Summary of the ending reached by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingSummary {
    /// Ending id from the story pack.
    pub id: String,
    /// Outcome label (`success`, `failure`, `neutral`).
    pub outcome: String,
    /// Ending title.
    pub title: String,
    /// Generated epilogue text.
    pub epilogue: String,
    /// Whether a timeout policy forced this ending.
    pub forced_by_timeout: bool,
}

/// Full result of a committed step. Identical for fresh and replayed requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The session advanced.
    pub session_id: Uuid,
    /// Idempotency key the step was committed under.
    pub idempotency_key: String,
    /// Index of this step; equals the session version after commit.
    pub step_index: i64,
    /// Session version after commit.
    pub version: i64,
    /// Session status after commit.
    pub status: SessionStatus,
    /// Current node after the step.
    pub node_id: String,
    /// Target that actually executed (after routing).
    pub resolved_target: ResolvedTarget,
    /// Router disposition.
    pub disposition: RouteDisposition,
    /// Scrubbed narration text.
    pub narrative: String,
    /// Full session state after the step.
    pub state: serde_json::Value,
    /// State changes applied by this step.
    pub state_delta: serde_json::Value,
    /// Ending reached by this step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ending: Option<EndingSummary>,
    /// Pipeline diagnostics (selection reason, mapper attempts, rejections).
    pub diagnostics: serde_json::Value,
}

/// Coarse pipeline stage labels emitted on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Input passed the policy gate.
    Accepted,
    /// Resolving input to a target.
    Selecting,
    /// Running the deterministic engines.
    Resolving,
    /// Generating narration.
    Narrating,
    /// Committing the step.
    Committing,
}

/// Ordered events of a streamed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StepStreamEvent {
    /// Echo of the request coordinates; always first.
    Meta {
        /// The idempotency key of the request.
        idempotency_key: String,
        /// The session addressed.
        session_id: Uuid,
    },
    /// A pipeline stage began.
    Phase {
        /// Stage label.
        phase: StepPhase,
    },
    /// Incremental narration text.
    NarrativeDelta {
        /// Scrubbed text fragment.
        text: String,
    },
    /// The request was served from the idempotency cache.
    Replay {
        /// The idempotency key replayed.
        idempotency_key: String,
    },
    /// The committed result.
    Final(Box<StepResult>),
    /// The step failed.
    Error {
        /// Wire error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// End of stream; always last.
    Done,
}

impl StepStreamEvent {
    /// The event name used on the wire.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Meta { .. } => "meta",
            Self::Phase { .. } => "phase",
            Self::NarrativeDelta { .. } => "narrative_delta",
            Self::Replay { .. } => "replay",
            Self::Final(_) => "final",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// Builds an `Error` event from a domain error.
    #[must_use]
    pub fn from_error(err: &DomainError) -> Self {
        Self::Error {
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }
}
