//! Integration tests for `PgSessionRepository`.

use chrono::{SubsecRound, Utc};
use fablestep_core::error::DomainError;
use fablestep_core::repository::{
    ActionLogEntry, IdempotencyStatus, KeyClaim, SessionRecord, SessionRepository, SessionStatus,
    StepCommit,
};
use fablestep_store::pg_session_repository::PgSessionRepository;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

/// Helper to build an active session at version 0.
fn make_session(id: Uuid) -> SessionRecord {
    let now = Utc::now().trunc_subsecs(6);
    SessionRecord {
        id,
        story_id: "lantern-keep".to_string(),
        story_version: 1,
        state: json!({"node_id": "gate", "stats": {"resolve": 5}}),
        version: 0,
        status: SessionStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

/// Helper to build the commit of step `expected_version + 1` under `key`.
fn make_commit(session_id: Uuid, expected_version: i64, key: &str) -> StepCommit {
    let step_index = expected_version + 1;
    StepCommit {
        session_id,
        expected_version,
        state: json!({"node_id": "hall", "step": step_index}),
        status: SessionStatus::Active,
        log_entry: ActionLogEntry {
            session_id,
            step_index,
            input: json!({"choice_id": "knock"}),
            resolved_target: json!({"kind": "visible", "id": "knock", "intensity_tier": 0}),
            state_before: json!({"node_id": "gate"}),
            state_delta: json!({"to_node": "hall"}),
            state_after: json!({"node_id": "hall"}),
            diagnostics: json!({"input_kind": "choice"}),
            committed_at: Utc::now().trunc_subsecs(6),
        },
        idempotency_key: key.to_string(),
        result: json!({"step_index": step_index, "narrative": "The door opens."}),
    }
}

// --- sessions ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_load_session_returns_none_for_unknown_id(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);

    let loaded = repo.load_session(Uuid::new_v4()).await.unwrap();

    assert!(loaded.is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_insert_and_load_session(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);
    let record = make_session(Uuid::new_v4());

    repo.insert_session(&record).await.unwrap();

    let loaded = repo.load_session(record.id).await.unwrap().unwrap();
    assert_eq!(loaded, record);
}

// --- idempotency keys ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_claim_states(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);
    let session_id = Uuid::new_v4();
    repo.insert_session(&make_session(session_id)).await.unwrap();
    let now = Utc::now();

    assert_eq!(
        repo.claim_idempotency_key("k1", session_id, "fp-1", now).await.unwrap(),
        KeyClaim::Claimed
    );
    assert_eq!(
        repo.claim_idempotency_key("k1", session_id, "fp-1", now).await.unwrap(),
        KeyClaim::InProgress
    );
    assert_eq!(
        repo.claim_idempotency_key("k1", session_id, "fp-2", now).await.unwrap(),
        KeyClaim::Mismatch
    );
    assert_eq!(
        repo.claim_idempotency_key("k1", Uuid::new_v4(), "fp-1", now).await.unwrap(),
        KeyClaim::Mismatch
    );
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_failed_key_records_reason_and_can_be_reclaimed(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);
    let session_id = Uuid::new_v4();
    let now = Utc::now();
    repo.claim_idempotency_key("k1", session_id, "fp", now).await.unwrap();

    repo.fail_idempotency_key("k1", "STREAM_ABORTED", now).await.unwrap();

    let record = repo.load_idempotency_record("k1").await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.failure_code.as_deref(), Some("STREAM_ABORTED"));
    assert_eq!(
        repo.claim_idempotency_key("k1", session_id, "fp", now).await.unwrap(),
        KeyClaim::Claimed
    );
}

// --- commit ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_commit_advances_version_and_replays_result(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);
    let session_id = Uuid::new_v4();
    repo.insert_session(&make_session(session_id)).await.unwrap();
    repo.claim_idempotency_key("k1", session_id, "fp", Utc::now()).await.unwrap();
    let commit = make_commit(session_id, 0, "k1");

    repo.commit_step(&commit).await.unwrap();

    let session = repo.load_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.version, 1);
    assert_eq!(session.state, commit.state);
    let log = repo.load_action_log(session_id).await.unwrap();
    assert_eq!(log, vec![commit.log_entry.clone()]);
    assert_eq!(
        repo.claim_idempotency_key("k1", session_id, "fp", Utc::now()).await.unwrap(),
        KeyClaim::Replay(commit.result)
    );
}

// --- concurrency ---

#[sqlx::test(migrations = "../../migrations")]
async fn test_stale_version_is_a_conflict(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);
    let session_id = Uuid::new_v4();
    repo.insert_session(&make_session(session_id)).await.unwrap();
    repo.commit_step(&make_commit(session_id, 0, "a")).await.unwrap();

    let result = repo.commit_step(&make_commit(session_id, 0, "b")).await;

    assert_eq!(
        result,
        Err(DomainError::ConcurrencyConflict {
            session_id,
            expected: 0,
            actual: 1,
        })
    );
    assert_eq!(repo.load_action_log(session_id).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_duplicate_step_index_rolls_back_the_version_bump(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);
    let session_id = Uuid::new_v4();
    repo.insert_session(&make_session(session_id)).await.unwrap();
    let mut first = make_commit(session_id, 0, "a");
    first.log_entry.step_index = 2;
    repo.commit_step(&first).await.unwrap();

    let result = repo.commit_step(&make_commit(session_id, 1, "b")).await;

    assert!(matches!(result, Err(DomainError::ConcurrencyConflict { .. })));
    let session = repo.load_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.version, 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_commit_against_unknown_session(pool: PgPool) {
    let repo = PgSessionRepository::new(pool);
    let session_id = Uuid::new_v4();

    let result = repo.commit_step(&make_commit(session_id, 0, "a")).await;

    assert_eq!(result, Err(DomainError::SessionNotFound(session_id)));
}
