//! Test repositories: `SessionRepository` doubles for error paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fablestep_core::error::DomainError;
use fablestep_core::repository::{
    ActionLogEntry, IdempotencyRecord, KeyClaim, SessionRecord, SessionRepository, StepCommit,
};
use uuid::Uuid;

/// A session repository that fails every call with an infrastructure error.
#[derive(Debug)]
pub struct FailingSessionRepository;

fn unavailable() -> DomainError {
    DomainError::Infrastructure("connection refused".to_owned())
}

#[async_trait]
impl SessionRepository for FailingSessionRepository {
    async fn load_session(&self, _session_id: Uuid) -> Result<Option<SessionRecord>, DomainError> {
        Err(unavailable())
    }

    async fn insert_session(&self, _record: &SessionRecord) -> Result<(), DomainError> {
        Err(unavailable())
    }

    async fn claim_idempotency_key(
        &self,
        _key: &str,
        _session_id: Uuid,
        _payload_fingerprint: &str,
        _now: DateTime<Utc>,
    ) -> Result<KeyClaim, DomainError> {
        Err(unavailable())
    }

    async fn fail_idempotency_key(
        &self,
        _key: &str,
        _failure_code: &str,
        _now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        Err(unavailable())
    }

    async fn load_idempotency_record(
        &self,
        _key: &str,
    ) -> Result<Option<IdempotencyRecord>, DomainError> {
        Err(unavailable())
    }

    async fn commit_step(&self, _commit: &StepCommit) -> Result<(), DomainError> {
        Err(unavailable())
    }

    async fn load_action_log(&self, _session_id: Uuid) -> Result<Vec<ActionLogEntry>, DomainError> {
        Err(unavailable())
    }
}
