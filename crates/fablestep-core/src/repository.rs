//! Session persistence abstraction.
//!
//! Sessions are rows addressed by id and version. A step loads a snapshot,
//! computes a new one, and commits it conditionally on the version it read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Lifecycle status of a session. `Active -> Ended` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Steps may be submitted.
    Active,
    /// An ending was reached; further steps fail with `SESSION_NOT_ACTIVE`.
    Ended,
}

impl SessionStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    /// Parses the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for an unknown value.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(DomainError::Infrastructure(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

/// Stored representation of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: Uuid,
    /// Story pack the session is bound to.
    pub story_id: String,
    /// Published pack version.
    pub story_version: i64,
    /// Serialized session state.
    pub state: serde_json::Value,
    /// Number of committed steps.
    pub version: i64,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last commit.
    pub updated_at: DateTime<Utc>,
}

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The pipeline is executing under this key.
    Pending,
    /// The step committed; the stored result is replayed.
    Succeeded,
    /// The step failed without committing.
    Failed,
}

impl IdempotencyStatus {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parses the storage representation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` for an unknown value.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::Infrastructure(format!(
                "unknown idempotency status: {other}"
            ))),
        }
    }
}

/// Stored idempotency record.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    /// Client-chosen key.
    pub key: String,
    /// Session the key was first used against.
    pub session_id: Uuid,
    /// Fingerprint of the first payload seen under the key.
    pub payload_fingerprint: String,
    /// Current status.
    pub status: IdempotencyStatus,
    /// Serialized `StepResult` once succeeded.
    pub result: Option<serde_json::Value>,
    /// Wire code of the last failure.
    pub failure_code: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last transition timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of claiming an idempotency key for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyClaim {
    /// The caller owns the key and must run the pipeline.
    Claimed,
    /// Same key and payload are executing elsewhere.
    InProgress,
    /// The key already succeeded; the stored result is returned verbatim.
    Replay(serde_json::Value),
    /// The key was used with another payload or session.
    Mismatch,
}

/// One committed step in the append-only action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    /// Session the step belongs to.
    pub session_id: Uuid,
    /// Step index; unique per session.
    pub step_index: i64,
    /// Serialized request payload.
    pub input: serde_json::Value,
    /// Serialized executed target.
    pub resolved_target: serde_json::Value,
    /// State before the step.
    pub state_before: serde_json::Value,
    /// Changes applied by the step.
    pub state_delta: serde_json::Value,
    /// State after the step.
    pub state_after: serde_json::Value,
    /// Pipeline diagnostics.
    pub diagnostics: serde_json::Value,
    /// Commit timestamp.
    pub committed_at: DateTime<Utc>,
}

/// Everything written atomically when a step commits.
#[derive(Debug, Clone)]
pub struct StepCommit {
    /// Session being advanced.
    pub session_id: Uuid,
    /// Version read before the pipeline ran.
    pub expected_version: i64,
    /// New serialized state.
    pub state: serde_json::Value,
    /// New status.
    pub status: SessionStatus,
    /// Action log row; its `step_index` is `expected_version + 1`.
    pub log_entry: ActionLogEntry,
    /// Key under which the result is stored.
    pub idempotency_key: String,
    /// Serialized `StepResult`.
    pub result: serde_json::Value,
}

/// Repository trait for sessions, idempotency records and the action log.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Loads a session row.
    async fn load_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, DomainError>;

    /// Inserts a freshly started session.
    async fn insert_session(&self, record: &SessionRecord) -> Result<(), DomainError>;

    /// Claims `key` for execution.
    ///
    /// An unseen key becomes `pending`. A `failed` key with the same session
    /// and fingerprint is reset to `pending` and claimed again.
    async fn claim_idempotency_key(
        &self,
        key: &str,
        session_id: Uuid,
        payload_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<KeyClaim, DomainError>;

    /// Marks a `pending` key as `failed` with the given wire code.
    async fn fail_idempotency_key(
        &self,
        key: &str,
        failure_code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError>;

    /// Loads an idempotency record.
    async fn load_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DomainError>;

    /// Atomically checks the session version, appends the action log row,
    /// writes the new state and marks the key `succeeded`.
    ///
    /// Returns `DomainError::ConcurrencyConflict` without writing anything if
    /// the version moved or the `(session_id, step_index)` row already exists.
    async fn commit_step(&self, commit: &StepCommit) -> Result<(), DomainError>;

    /// Loads the action log of a session ordered by step index.
    async fn load_action_log(&self, session_id: Uuid) -> Result<Vec<ActionLogEntry>, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_storage_strings() {
        for status in [SessionStatus::Active, SessionStatus::Ended] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SessionStatus::parse("paused").is_err());
        assert_eq!(
            IdempotencyStatus::parse("failed").unwrap(),
            IdempotencyStatus::Failed
        );
        assert!(IdempotencyStatus::parse("done").is_err());
    }
}
