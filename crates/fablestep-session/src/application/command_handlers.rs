//! Command handlers for the Session & Step Commit context.
//!
//! This module contains application-level command handler functions that
//! orchestrate domain logic: load the snapshot, run the pipeline, commit.

use fablestep_core::clock::Clock;
use fablestep_core::error::DomainError;
use fablestep_core::repository::SessionRepository;
use fablestep_story::catalog::StoryCatalog;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::application::pipeline::{SilentObserver, StepOutcome, submit};
use crate::application::query_handlers::SessionView;
use crate::application::runtime::StepRuntime;
use crate::domain::aggregates::Session;
use crate::domain::commands::{StartSession, SubmitStep};

/// Handles the `StartSession` command: loads the pack, builds the initial
/// snapshot and persists it at version 0.
///
/// # Errors
///
/// Returns `DomainError::StoryNotFound` for an unpublished pack and
/// `DomainError::Infrastructure` if persisting fails.
#[instrument(
    skip_all,
    fields(correlation_id = %command.correlation_id, story_id = %command.story_id)
)]
pub async fn handle_start_session(
    command: &StartSession,
    catalog: &dyn StoryCatalog,
    clock: &dyn Clock,
    repo: &dyn SessionRepository,
) -> Result<SessionView, DomainError> {
    let pack = catalog
        .load(&command.story_id, command.story_version)
        .await?;
    let now = clock.now();
    let session = Session::start(Uuid::new_v4(), &pack, now);
    let record = session.to_record(now);

    repo.insert_session(&record).await?;
    info!(session_id = %session.id, "session started");

    Ok(SessionView::from_record(&record))
}

/// Handles the `SubmitStep` command and returns the committed (or replayed)
/// result.
///
/// # Errors
///
/// Returns the boundary error of the first failing stage; see
/// [`submit`](crate::application::pipeline::submit).
#[instrument(
    skip_all,
    fields(
        correlation_id = %command.correlation_id,
        session_id = %command.session_id,
        idempotency_key = %command.idempotency_key,
    )
)]
pub async fn handle_submit_step(
    command: &SubmitStep,
    runtime: &StepRuntime,
) -> Result<StepOutcome, DomainError> {
    submit(command, runtime, &mut SilentObserver).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use fablestep_core::config::StepPolicy;
    use fablestep_core::repository::{IdempotencyStatus, SessionStatus};
    use fablestep_core::step::{RouteDisposition, StepPayload, TargetKind};
    use fablestep_narrative::domain::mapper::MappedTargetType;
    use fablestep_rules::domain::state::SessionState;
    use fablestep_store::memory::InMemorySessionRepository;
    use fablestep_story::catalog::InMemoryCatalog;
    use fablestep_story::domain::pack::StoryPack;
    use fablestep_test_support::{
        FailingSessionRepository, FixedClock, ScriptedMapper, ScriptedNarrator, fixtures,
    };

    use super::*;

    struct Harness {
        repo: Arc<InMemorySessionRepository>,
        catalog: Arc<InMemoryCatalog>,
        clock: Arc<FixedClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_pack(fixtures::lantern_keep())
        }

        fn with_pack(pack: StoryPack) -> Self {
            let mut catalog = InMemoryCatalog::new();
            catalog.publish(pack).unwrap();
            Self {
                repo: Arc::new(InMemorySessionRepository::new()),
                catalog: Arc::new(catalog),
                clock: Arc::new(FixedClock(
                    Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
                )),
            }
        }

        fn runtime(&self, mapper: ScriptedMapper, narrator: ScriptedNarrator) -> StepRuntime {
            StepRuntime {
                repo: self.repo.clone(),
                catalog: self.catalog.clone(),
                mapper: Arc::new(mapper),
                narrator: Arc::new(narrator),
                clock: self.clock.clone(),
                policy: StepPolicy::default(),
            }
        }

        fn default_runtime(&self) -> StepRuntime {
            self.runtime(
                ScriptedMapper::mapping(MappedTargetType::Choice, "knock", 0.95),
                ScriptedNarrator::new(&["The gate ", "groans open."]),
            )
        }

        async fn start(&self) -> Uuid {
            let command = StartSession {
                correlation_id: Uuid::new_v4(),
                story_id: "lantern-keep".into(),
                story_version: 1,
            };
            handle_start_session(
                &command,
                self.catalog.as_ref(),
                self.clock.as_ref(),
                self.repo.as_ref(),
            )
            .await
            .unwrap()
            .session_id
        }

        async fn state(&self, session_id: Uuid) -> (i64, SessionState) {
            let record = self.repo.load_session(session_id).await.unwrap().unwrap();
            (record.version, SessionState::from_value(&record.state).unwrap())
        }
    }

    fn step(session_id: Uuid, key: &str, payload: StepPayload) -> SubmitStep {
        SubmitStep {
            correlation_id: Uuid::new_v4(),
            session_id,
            idempotency_key: key.into(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_handle_start_session_persists_version_zero() {
        // Arrange
        let harness = Harness::new();

        // Act
        let session_id = harness.start().await;

        // Assert
        let record = harness.repo.load_session(session_id).await.unwrap().unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.created_at, harness.clock.0);
        let state = SessionState::from_value(&record.state).unwrap();
        assert_eq!(state.node_id, "gate");
        assert!(state.quest_state.active.contains("light_the_beacon"));
    }

    #[tokio::test]
    async fn test_handle_start_session_unknown_story() {
        let harness = Harness::new();
        let command = StartSession {
            correlation_id: Uuid::new_v4(),
            story_id: "missing".into(),
            story_version: 1,
        };

        let result = handle_start_session(
            &command,
            harness.catalog.as_ref(),
            harness.clock.as_ref(),
            harness.repo.as_ref(),
        )
        .await;

        assert!(matches!(result, Err(DomainError::StoryNotFound { .. })));
    }

    #[tokio::test]
    async fn test_explicit_choice_commits_one_step() {
        // Arrange
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.default_runtime();

        // Act
        let outcome =
            handle_submit_step(&step(session_id, "k1", StepPayload::choice("knock")), &runtime)
                .await
                .unwrap();

        // Assert
        assert!(!outcome.replayed);
        assert_eq!(outcome.result.step_index, 1);
        assert_eq!(outcome.result.version, 1);
        assert_eq!(outcome.result.node_id, "hall");
        assert_eq!(outcome.result.disposition, RouteDisposition::Executed);
        assert_eq!(outcome.result.narrative, "The gate groans open.");
        let (version, state) = harness.state(session_id).await;
        assert_eq!(version, 1);
        assert_eq!(state.stat("resolve"), Some(6));
        let log = harness.repo.load_action_log(session_id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].step_index, 1);
        assert_eq!(log[0].state_after, outcome.result.state);
    }

    #[tokio::test]
    async fn test_same_key_and_payload_replays_byte_identical_result() {
        // Arrange
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.default_runtime();
        let command = step(session_id, "k1", StepPayload::choice("knock"));

        // Act
        let first = handle_submit_step(&command, &runtime).await.unwrap();
        let second = handle_submit_step(&command, &runtime).await.unwrap();

        // Assert
        assert!(second.replayed);
        assert_eq!(
            serde_json::to_vec(&first.body).unwrap(),
            serde_json::to_vec(&second.body).unwrap()
        );
        assert_eq!(first.result, second.result);
        assert_eq!(harness.state(session_id).await.0, 1);
        assert_eq!(harness.repo.load_action_log(session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_different_payload_under_succeeded_key_is_terminal() {
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.default_runtime();
        handle_submit_step(&step(session_id, "k1", StepPayload::choice("knock")), &runtime)
            .await
            .unwrap();

        let result = handle_submit_step(
            &step(session_id, "k1", StepPayload::choice("climb")),
            &runtime,
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err, DomainError::IdempotencyKeyReused("k1".into()));
        assert!(!err.is_retryable());
        assert_eq!(harness.state(session_id).await.0, 1);
    }

    #[tokio::test]
    async fn test_pending_key_is_in_progress_without_running_the_pipeline() {
        // Arrange: another worker holds the key.
        let harness = Harness::new();
        let session_id = harness.start().await;
        let narrator = ScriptedNarrator::new(&["unused"]);
        let runtime = harness.runtime(
            ScriptedMapper::mapping(MappedTargetType::Choice, "knock", 0.95),
            narrator,
        );
        let fingerprint = StepPayload::choice("knock").fingerprint();
        harness
            .repo
            .claim_idempotency_key("k1", session_id, &fingerprint, Utc::now())
            .await
            .unwrap();

        // Act
        let same = handle_submit_step(
            &step(session_id, "k1", StepPayload::choice("knock")),
            &runtime,
        )
        .await;
        let other = handle_submit_step(
            &step(session_id, "k1", StepPayload::choice("climb")),
            &runtime,
        )
        .await;

        // Assert
        assert_eq!(same, Err(DomainError::RequestInProgress("k1".into())));
        assert_eq!(other, Err(DomainError::IdempotencyKeyReused("k1".into())));
        assert_eq!(harness.state(session_id).await.0, 0);
        let record = harness.repo.load_idempotency_record("k1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Pending);
    }

    #[tokio::test]
    async fn test_contract_errors_record_nothing() {
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.default_runtime();
        let both = StepPayload {
            choice_id: Some("knock".into()),
            player_input: Some("knock".into()),
        };

        let conflict = handle_submit_step(&step(session_id, "k1", both), &runtime).await;
        let missing = handle_submit_step(
            &step(session_id, "  ", StepPayload::choice("knock")),
            &runtime,
        )
        .await;

        assert_eq!(conflict, Err(DomainError::InputConflict));
        assert_eq!(missing, Err(DomainError::MissingIdempotencyKey));
        assert!(harness.repo.load_idempotency_record("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_and_locked_choices_fail_the_key() {
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.default_runtime();

        let invalid = handle_submit_step(
            &step(session_id, "k1", StepPayload::choice("fly")),
            &runtime,
        )
        .await;
        let locked = handle_submit_step(
            &step(session_id, "k2", StepPayload::choice("bribe")),
            &runtime,
        )
        .await;

        assert_eq!(invalid, Err(DomainError::InvalidChoice("fly".into())));
        assert_eq!(locked, Err(DomainError::ChoiceLocked("bribe".into())));
        let record = harness.repo.load_idempotency_record("k2").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
        assert_eq!(record.failure_code.as_deref(), Some("CHOICE_LOCKED"));
        assert_eq!(harness.state(session_id).await.0, 0);
    }

    #[tokio::test]
    async fn test_free_text_maps_through_intent_with_extension_ops() {
        // Arrange
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.runtime(
            ScriptedMapper::mapping(MappedTargetType::Intent, "plead", 0.9),
            ScriptedNarrator::new(&["The keeper relents."]),
        );

        // Act
        let outcome = handle_submit_step(
            &step(session_id, "k1", StepPayload::free_text("please, let me in")),
            &runtime,
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(outcome.result.resolved_target.id, "knock");
        assert_eq!(outcome.result.node_id, "hall");
        let (_, state) = harness.state(session_id).await;
        let keeper = &state.npc_state.npcs["keeper"];
        assert_eq!(keeper.relation, 5);
        assert_eq!(keeper.mood.as_deref(), Some("softened"));
    }

    #[tokio::test]
    async fn test_low_confidence_executes_fallback_with_penalty() {
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.runtime(
            ScriptedMapper::mapping(MappedTargetType::Choice, "knock", 0.5),
            ScriptedNarrator::new(&["You hesitate, thinking."]),
        );

        let outcome = handle_submit_step(
            &step(session_id, "k1", StepPayload::free_text("maybe knock?")),
            &runtime,
        )
        .await
        .unwrap();

        assert_eq!(outcome.result.resolved_target.kind, TargetKind::Fallback);
        assert_eq!(outcome.result.resolved_target.id, "ponder");
        assert_eq!(outcome.result.node_id, "gate");
        assert_eq!(outcome.result.diagnostics["selection"]["fallback_reason"], "low_confidence");
        // ponder scales resolve by intensity 1 at tier clamp(-1 + 0) = -1.
        let (_, state) = harness.state(session_id).await;
        assert_eq!(state.stat("resolve"), Some(4));
        assert_eq!(state.run_state.fallback_count, 1);
    }

    #[tokio::test]
    async fn test_doubly_blocked_step_commits_without_events_or_quest_progress() {
        // Arrange: events may fire anywhere, and free text maps to climb,
        // which is blocked at resolve 5 along with its fallback stumble.
        let mut pack = fixtures::lantern_keep();
        for event in &mut pack.events {
            event.pre.clear();
        }
        let harness = Harness::with_pack(pack);
        let session_id = harness.start().await;
        let (_, before) = harness.state(session_id).await;
        let runtime = harness.runtime(
            ScriptedMapper::mapping(MappedTargetType::Choice, "climb", 0.95),
            ScriptedNarrator::new(&["You think better of it."]),
        );

        // Act
        let outcome = handle_submit_step(
            &step(session_id, "k1", StepPayload::free_text("climb the wall")),
            &runtime,
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(outcome.result.disposition, RouteDisposition::Degraded);
        let (version, after) = harness.state(session_id).await;
        assert_eq!(version, 1);
        assert_eq!(after.node_id, before.node_id);
        assert_eq!(after.stats, before.stats);
        assert_eq!(after.quest_state, before.quest_state);
        assert!(after.run_state.triggered_events.is_empty());
        assert_eq!(after.run_state.step_index, 1);
        assert_eq!(after.run_state.fallback_count, 1);
    }

    #[tokio::test]
    async fn test_mapper_exhaustion_discards_the_step() {
        // Arrange
        let harness = Harness::new();
        let session_id = harness.start().await;
        let narrator = ScriptedNarrator::new(&["never"]);
        let runtime = harness.runtime(ScriptedMapper::unavailable(), narrator);

        // Act
        let result = handle_submit_step(
            &step(session_id, "k1", StepPayload::free_text("knock on the gate")),
            &runtime,
        )
        .await;

        // Assert
        let err = result.unwrap_err();
        assert_eq!(err.code(), "MODEL_UNAVAILABLE");
        let (version, state) = harness.state(session_id).await;
        assert_eq!(version, 0);
        assert_eq!(state, SessionState::initial(&fixtures::lantern_keep()));
        let record = harness.repo.load_idempotency_record("k1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
        assert_eq!(record.failure_code.as_deref(), Some("MODEL_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn test_narration_failure_mid_stream_discards_the_step() {
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.runtime(
            ScriptedMapper::mapping(MappedTargetType::Choice, "knock", 0.95),
            ScriptedNarrator::new(&["The gate "]).failing_mid_stream(),
        );

        let result = handle_submit_step(
            &step(session_id, "k1", StepPayload::choice("knock")),
            &runtime,
        )
        .await;

        assert!(matches!(result, Err(DomainError::ModelUnavailable(_))));
        assert_eq!(harness.state(session_id).await.0, 0);
        assert!(harness.repo.load_action_log(session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quest_reward_applies_once_across_a_failed_attempt_and_replay() {
        // Arrange: the first attempt fails in narration, the retry with the
        // same key succeeds, a third call replays.
        let harness = Harness::new();
        let session_id = harness.start().await;
        let command = step(session_id, "k1", StepPayload::choice("knock"));
        let failing = harness.runtime(
            ScriptedMapper::mapping(MappedTargetType::Choice, "knock", 0.95),
            ScriptedNarrator::new(&["x"]).refusing(),
        );
        let working = harness.default_runtime();

        // Act
        let first = handle_submit_step(&command, &failing).await;
        let second = handle_submit_step(&command, &working).await.unwrap();
        let third = handle_submit_step(&command, &working).await.unwrap();

        // Assert
        assert!(first.is_err());
        assert!(!second.replayed);
        assert!(third.replayed);
        let (version, state) = harness.state(session_id).await;
        assert_eq!(version, 1);
        // 3 starting coins plus the enter_keep stage reward of 2.
        assert_eq!(state.inventory.currency, 5);
        assert_eq!(state.quest_state.stages["light_the_beacon"], 1);
    }

    #[tokio::test]
    async fn test_reaching_an_ending_ends_the_session() {
        // Arrange
        let harness = Harness::new();
        let session_id = harness.start().await;
        let runtime = harness.default_runtime();
        handle_submit_step(&step(session_id, "k1", StepPayload::choice("knock")), &runtime)
            .await
            .unwrap();

        // Act
        let outcome =
            handle_submit_step(&step(session_id, "k2", StepPayload::choice("light")), &runtime)
                .await
                .unwrap();
        let after = handle_submit_step(
            &step(session_id, "k3", StepPayload::choice("wait")),
            &runtime,
        )
        .await;

        // Assert
        assert_eq!(outcome.result.status, SessionStatus::Ended);
        let ending = outcome.result.ending.unwrap();
        assert_eq!(ending.id, "dawn");
        assert_eq!(ending.epilogue, "And so the night ends.");
        assert!(!ending.forced_by_timeout);
        assert_eq!(after, Err(DomainError::SessionNotActive(session_id)));
        let (version, state) = harness.state(session_id).await;
        assert_eq!(version, 2);
        assert!(state.quest_state.completed.contains("light_the_beacon"));
    }

    #[tokio::test]
    async fn test_epilogue_failure_discards_the_ending_step() {
        let harness = Harness::new();
        let session_id = harness.start().await;
        handle_submit_step(
            &step(session_id, "k1", StepPayload::choice("knock")),
            &harness.default_runtime(),
        )
        .await
        .unwrap();
        let runtime = harness.runtime(
            ScriptedMapper::mapping(MappedTargetType::Choice, "light", 0.95),
            ScriptedNarrator::new(&["The flame catches."]).failing_epilogue(),
        );

        let result = handle_submit_step(
            &step(session_id, "k2", StepPayload::choice("light")),
            &runtime,
        )
        .await;

        assert!(matches!(result, Err(DomainError::ModelUnavailable(_))));
        let (version, state) = harness.state(session_id).await;
        assert_eq!(version, 1);
        assert!(!state.is_ended());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let harness = Harness::new();
        let runtime = harness.default_runtime();
        let session_id = Uuid::new_v4();

        let result = handle_submit_step(
            &step(session_id, "k1", StepPayload::choice("knock")),
            &runtime,
        )
        .await;

        assert_eq!(result, Err(DomainError::SessionNotFound(session_id)));
    }

    #[tokio::test]
    async fn test_repository_failure_is_infrastructure() {
        let harness = Harness::new();
        let mut runtime = harness.default_runtime();
        runtime.repo = Arc::new(FailingSessionRepository);

        let result = handle_submit_step(
            &step(Uuid::new_v4(), "k1", StepPayload::choice("knock")),
            &runtime,
        )
        .await;

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }
}
