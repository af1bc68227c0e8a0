//! In-memory `SessionRepository`.
//!
//! All tables live behind one mutex, so every operation is atomic with
//! respect to the others. The semantics match the `PostgreSQL` store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use fablestep_core::error::DomainError;
use fablestep_core::repository::{
    ActionLogEntry, IdempotencyRecord, IdempotencyStatus, KeyClaim, SessionRecord,
    SessionRepository, StepCommit,
};

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<Uuid, SessionRecord>,
    keys: HashMap<String, IdempotencyRecord>,
    log: HashMap<Uuid, BTreeMap<i64, ActionLogEntry>>,
}

/// Session store held in process memory.
#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    tables: Mutex<Tables>,
}

impl InMemorySessionRepository {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, DomainError> {
        self.tables
            .lock()
            .map_err(|_| DomainError::Infrastructure("session store lock poisoned".into()))
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn load_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, DomainError> {
        Ok(self.tables()?.sessions.get(&session_id).cloned())
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<(), DomainError> {
        let mut tables = self.tables()?;
        if tables.sessions.contains_key(&record.id) {
            return Err(DomainError::Infrastructure(format!(
                "session {} already exists",
                record.id
            )));
        }
        tables.sessions.insert(record.id, record.clone());
        Ok(())
    }

    async fn claim_idempotency_key(
        &self,
        key: &str,
        session_id: Uuid,
        payload_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<KeyClaim, DomainError> {
        let mut tables = self.tables()?;
        let Some(record) = tables.keys.get_mut(key) else {
            tables.keys.insert(
                key.to_owned(),
                IdempotencyRecord {
                    key: key.to_owned(),
                    session_id,
                    payload_fingerprint: payload_fingerprint.to_owned(),
                    status: IdempotencyStatus::Pending,
                    result: None,
                    failure_code: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            return Ok(KeyClaim::Claimed);
        };

        if record.session_id != session_id || record.payload_fingerprint != payload_fingerprint {
            return Ok(KeyClaim::Mismatch);
        }
        Ok(match record.status {
            IdempotencyStatus::Pending => KeyClaim::InProgress,
            IdempotencyStatus::Succeeded => {
                KeyClaim::Replay(record.result.clone().unwrap_or_default())
            }
            IdempotencyStatus::Failed => {
                record.status = IdempotencyStatus::Pending;
                record.failure_code = None;
                record.updated_at = now;
                KeyClaim::Claimed
            }
        })
    }

    async fn fail_idempotency_key(
        &self,
        key: &str,
        failure_code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut tables = self.tables()?;
        if let Some(record) = tables.keys.get_mut(key)
            && record.status == IdempotencyStatus::Pending
        {
            record.status = IdempotencyStatus::Failed;
            record.failure_code = Some(failure_code.to_owned());
            record.updated_at = now;
        }
        Ok(())
    }

    async fn load_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DomainError> {
        Ok(self.tables()?.keys.get(key).cloned())
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<(), DomainError> {
        let mut tables = self.tables()?;
        let Tables {
            sessions,
            keys,
            log,
        } = &mut *tables;

        let session = sessions
            .get_mut(&commit.session_id)
            .ok_or(DomainError::SessionNotFound(commit.session_id))?;
        let conflict = DomainError::ConcurrencyConflict {
            session_id: commit.session_id,
            expected: commit.expected_version,
            actual: session.version,
        };
        if session.version != commit.expected_version {
            return Err(conflict);
        }
        let session_log = log.entry(commit.session_id).or_default();
        if session_log.contains_key(&commit.log_entry.step_index) {
            return Err(conflict);
        }

        let now = commit.log_entry.committed_at;
        session.state = commit.state.clone();
        session.status = commit.status;
        session.version += 1;
        session.updated_at = now;
        session_log.insert(commit.log_entry.step_index, commit.log_entry.clone());
        if let Some(record) = keys.get_mut(&commit.idempotency_key) {
            record.status = IdempotencyStatus::Succeeded;
            record.result = Some(commit.result.clone());
            record.failure_code = None;
            record.updated_at = now;
        }
        Ok(())
    }

    async fn load_action_log(&self, session_id: Uuid) -> Result<Vec<ActionLogEntry>, DomainError> {
        Ok(self
            .tables()?
            .log
            .get(&session_id)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use fablestep_core::repository::SessionStatus;
    use serde_json::json;

    use super::*;

    fn session(id: Uuid) -> SessionRecord {
        SessionRecord {
            id,
            story_id: "lantern-keep".into(),
            story_version: 1,
            state: json!({"node_id": "gate"}),
            version: 0,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn commit(session_id: Uuid, expected_version: i64, key: &str) -> StepCommit {
        StepCommit {
            session_id,
            expected_version,
            state: json!({"node_id": "hall"}),
            status: SessionStatus::Active,
            log_entry: ActionLogEntry {
                session_id,
                step_index: expected_version + 1,
                input: json!({"choice_id": "knock"}),
                resolved_target: json!({"id": "knock"}),
                state_before: json!({"node_id": "gate"}),
                state_delta: json!({}),
                state_after: json!({"node_id": "hall"}),
                diagnostics: json!({}),
                committed_at: Utc::now(),
            },
            idempotency_key: key.into(),
            result: json!({"step_index": expected_version + 1}),
        }
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        // Arrange
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();
        repo.insert_session(&session(id)).await.unwrap();

        // Act / Assert
        assert_eq!(
            repo.claim_idempotency_key("k1", id, "fp", Utc::now()).await.unwrap(),
            KeyClaim::Claimed
        );
        assert_eq!(
            repo.claim_idempotency_key("k1", id, "fp", Utc::now()).await.unwrap(),
            KeyClaim::InProgress
        );
        assert_eq!(
            repo.claim_idempotency_key("k1", id, "other", Utc::now()).await.unwrap(),
            KeyClaim::Mismatch
        );

        repo.commit_step(&commit(id, 0, "k1")).await.unwrap();
        assert_eq!(
            repo.claim_idempotency_key("k1", id, "fp", Utc::now()).await.unwrap(),
            KeyClaim::Replay(json!({"step_index": 1}))
        );
    }

    #[tokio::test]
    async fn test_failed_key_is_reclaimable() {
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();
        repo.claim_idempotency_key("k1", id, "fp", Utc::now()).await.unwrap();
        repo.fail_idempotency_key("k1", "STREAM_ABORTED", Utc::now()).await.unwrap();

        let record = repo.load_idempotency_record("k1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
        assert_eq!(record.failure_code.as_deref(), Some("STREAM_ABORTED"));

        assert_eq!(
            repo.claim_idempotency_key("k1", id, "fp", Utc::now()).await.unwrap(),
            KeyClaim::Claimed
        );
        let record = repo.load_idempotency_record("k1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Pending);
        assert!(record.failure_code.is_none());
    }

    #[tokio::test]
    async fn test_stale_commit_is_a_conflict_and_writes_nothing() {
        // Arrange
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();
        repo.insert_session(&session(id)).await.unwrap();
        repo.claim_idempotency_key("a", id, "fa", Utc::now()).await.unwrap();
        repo.claim_idempotency_key("b", id, "fb", Utc::now()).await.unwrap();
        repo.commit_step(&commit(id, 0, "a")).await.unwrap();

        // Act
        let result = repo.commit_step(&commit(id, 0, "b")).await;

        // Assert
        assert_eq!(
            result,
            Err(DomainError::ConcurrencyConflict {
                session_id: id,
                expected: 0,
                actual: 1,
            })
        );
        assert_eq!(repo.load_session(id).await.unwrap().unwrap().version, 1);
        assert_eq!(repo.load_action_log(id).await.unwrap().len(), 1);
        let loser = repo.load_idempotency_record("b").await.unwrap().unwrap();
        assert_eq!(loser.status, IdempotencyStatus::Pending);
    }

    #[tokio::test]
    async fn test_duplicate_step_index_is_rejected() {
        // Arrange: the version check passes but the log row already exists.
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();
        repo.insert_session(&session(id)).await.unwrap();
        let mut first = commit(id, 0, "a");
        first.log_entry.step_index = 2;
        repo.commit_step(&first).await.unwrap();

        // Act
        let second = commit(id, 1, "b");
        let result = repo.commit_step(&second).await;

        // Assert
        assert!(matches!(result, Err(DomainError::ConcurrencyConflict { .. })));
        assert_eq!(repo.load_session(id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_commit_against_unknown_session() {
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();
        assert_eq!(
            repo.commit_step(&commit(id, 0, "a")).await,
            Err(DomainError::SessionNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_action_log_is_ordered_by_step_index() {
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();
        repo.insert_session(&session(id)).await.unwrap();
        for version in 0..3 {
            repo.commit_step(&commit(id, version, &format!("k{version}")))
                .await
                .unwrap();
        }

        let log = repo.load_action_log(id).await.unwrap();
        let indexes: Vec<i64> = log.iter().map(|e| e.step_index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert!(repo.load_action_log(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
