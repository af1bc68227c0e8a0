//! `PostgreSQL` implementation of the `SessionRepository` trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use fablestep_core::error::DomainError;
use fablestep_core::repository::{
    ActionLogEntry, IdempotencyRecord, IdempotencyStatus, KeyClaim, SessionRecord,
    SessionRepository, SessionStatus, StepCommit,
};

/// PostgreSQL-backed session repository.
#[derive(Debug, Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    /// Creates a new `PgSessionRepository`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn infra(err: sqlx::Error) -> DomainError {
    DomainError::Infrastructure(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn session_from_row(row: &PgRow) -> Result<SessionRecord, DomainError> {
    let status: String = row.try_get("status").map_err(infra)?;
    Ok(SessionRecord {
        id: row.try_get("id").map_err(infra)?,
        story_id: row.try_get("story_id").map_err(infra)?,
        story_version: row.try_get("story_version").map_err(infra)?,
        state: row.try_get("state").map_err(infra)?,
        version: row.try_get("version").map_err(infra)?,
        status: SessionStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(infra)?,
        updated_at: row.try_get("updated_at").map_err(infra)?,
    })
}

fn key_from_row(row: &PgRow) -> Result<IdempotencyRecord, DomainError> {
    let status: String = row.try_get("status").map_err(infra)?;
    Ok(IdempotencyRecord {
        key: row.try_get("key").map_err(infra)?,
        session_id: row.try_get("session_id").map_err(infra)?,
        payload_fingerprint: row.try_get("payload_fingerprint").map_err(infra)?,
        status: IdempotencyStatus::parse(&status)?,
        result: row.try_get("result").map_err(infra)?,
        failure_code: row.try_get("failure_code").map_err(infra)?,
        created_at: row.try_get("created_at").map_err(infra)?,
        updated_at: row.try_get("updated_at").map_err(infra)?,
    })
}

fn log_entry_from_row(row: &PgRow) -> Result<ActionLogEntry, DomainError> {
    Ok(ActionLogEntry {
        session_id: row.try_get("session_id").map_err(infra)?,
        step_index: row.try_get("step_index").map_err(infra)?,
        input: row.try_get("input").map_err(infra)?,
        resolved_target: row.try_get("resolved_target").map_err(infra)?,
        state_before: row.try_get("state_before").map_err(infra)?,
        state_delta: row.try_get("state_delta").map_err(infra)?,
        state_after: row.try_get("state_after").map_err(infra)?,
        diagnostics: row.try_get("diagnostics").map_err(infra)?,
        committed_at: row.try_get("committed_at").map_err(infra)?,
    })
}

const KEY_COLUMNS: &str = "key, session_id, payload_fingerprint, status, result, failure_code, \
                           created_at, updated_at";

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn load_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, DomainError> {
        let row = sqlx::query(
            "SELECT id, story_id, story_version, state, version, status, created_at, updated_at \
             FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert_session(&self, record: &SessionRecord) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO sessions \
             (id, story_id, story_version, state, version, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(&record.story_id)
        .bind(record.story_version)
        .bind(&record.state)
        .bind(record.version)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn claim_idempotency_key(
        &self,
        key: &str,
        session_id: Uuid,
        payload_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<KeyClaim, DomainError> {
        let mut tx = self.pool.begin().await.map_err(infra)?;

        let inserted = sqlx::query(
            "INSERT INTO idempotency_records \
             (key, session_id, payload_fingerprint, status, created_at, updated_at) \
             VALUES ($1, $2, $3, 'pending', $4, $4) \
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(session_id)
        .bind(payload_fingerprint)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(infra)?;
        if inserted.rows_affected() == 1 {
            tx.commit().await.map_err(infra)?;
            return Ok(KeyClaim::Claimed);
        }

        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM idempotency_records WHERE key = $1 FOR UPDATE"
        ))
        .bind(key)
        .fetch_one(&mut *tx)
        .await
        .map_err(infra)?;
        let record = key_from_row(&row)?;

        let claim = if record.session_id != session_id
            || record.payload_fingerprint != payload_fingerprint
        {
            KeyClaim::Mismatch
        } else {
            match record.status {
                IdempotencyStatus::Pending => KeyClaim::InProgress,
                IdempotencyStatus::Succeeded => KeyClaim::Replay(record.result.unwrap_or_default()),
                IdempotencyStatus::Failed => {
                    sqlx::query(
                        "UPDATE idempotency_records \
                         SET status = 'pending', failure_code = NULL, updated_at = $2 \
                         WHERE key = $1",
                    )
                    .bind(key)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(infra)?;
                    debug!(key, "reclaimed failed idempotency key");
                    KeyClaim::Claimed
                }
            }
        };
        tx.commit().await.map_err(infra)?;
        Ok(claim)
    }

    async fn fail_idempotency_key(
        &self,
        key: &str,
        failure_code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        sqlx::query(
            "UPDATE idempotency_records \
             SET status = 'failed', failure_code = $2, updated_at = $3 \
             WHERE key = $1 AND status = 'pending'",
        )
        .bind(key)
        .bind(failure_code)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(infra)?;
        Ok(())
    }

    async fn load_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, DomainError> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM idempotency_records WHERE key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(infra)?;
        row.as_ref().map(key_from_row).transpose()
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(infra)?;
        let now = commit.log_entry.committed_at;

        let updated = sqlx::query(
            "UPDATE sessions SET state = $3, status = $4, version = version + 1, updated_at = $5 \
             WHERE id = $1 AND version = $2",
        )
        .bind(commit.session_id)
        .bind(commit.expected_version)
        .bind(&commit.state)
        .bind(commit.status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(infra)?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM sessions WHERE id = $1")
                    .bind(commit.session_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(infra)?;
            return Err(match actual {
                Some(actual) => DomainError::ConcurrencyConflict {
                    session_id: commit.session_id,
                    expected: commit.expected_version,
                    actual,
                },
                None => DomainError::SessionNotFound(commit.session_id),
            });
        }

        let entry = &commit.log_entry;
        let appended = sqlx::query(
            "INSERT INTO action_log \
             (session_id, step_index, input, resolved_target, state_before, state_delta, \
              state_after, diagnostics, committed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.session_id)
        .bind(entry.step_index)
        .bind(&entry.input)
        .bind(&entry.resolved_target)
        .bind(&entry.state_before)
        .bind(&entry.state_delta)
        .bind(&entry.state_after)
        .bind(&entry.diagnostics)
        .bind(now)
        .execute(&mut *tx)
        .await;
        if let Err(err) = appended {
            return Err(if is_unique_violation(&err) {
                DomainError::ConcurrencyConflict {
                    session_id: commit.session_id,
                    expected: commit.expected_version,
                    actual: entry.step_index,
                }
            } else {
                infra(err)
            });
        }

        sqlx::query(
            "UPDATE idempotency_records \
             SET status = 'succeeded', result = $2, failure_code = NULL, updated_at = $3 \
             WHERE key = $1",
        )
        .bind(&commit.idempotency_key)
        .bind(&commit.result)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(infra)?;

        tx.commit().await.map_err(infra)?;
        Ok(())
    }

    async fn load_action_log(&self, session_id: Uuid) -> Result<Vec<ActionLogEntry>, DomainError> {
        let rows = sqlx::query(
            "SELECT session_id, step_index, input, resolved_target, state_before, state_delta, \
             state_after, diagnostics, committed_at \
             FROM action_log WHERE session_id = $1 ORDER BY step_index ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(infra)?;
        rows.iter().map(log_entry_from_row).collect()
    }
}
