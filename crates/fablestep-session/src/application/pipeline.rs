//! The step pipeline and its commit protocol.
//!
//! `submit` claims the idempotency key, runs selection, the deterministic
//! engines and narration against a snapshot of the session, and commits the
//! new snapshot conditionally on the version it read. Any failure after the
//! claim marks the key `failed` with the error's wire code; nothing else is
//! written.

use async_trait::async_trait;
use fablestep_core::error::DomainError;
use fablestep_core::repository::{ActionLogEntry, KeyClaim, StepCommit};
use fablestep_core::step::{EndingSummary, RouteDisposition, StepInput, StepPhase, StepResult};
use fablestep_narrative::domain::gate::{GateVerdict, InputPolicyGate};
use fablestep_narrative::domain::mapper::scene_text;
use fablestep_narrative::domain::model::ModelFailure;
use fablestep_narrative::domain::narrator::{EpilogueRequest, NarrationRequest};
use fablestep_narrative::domain::scrub::{Scrubber, StreamScrubber};
use fablestep_narrative::domain::selector::{SelectionContext, SelectionDiagnostics, Selector};
use fablestep_rules::domain::prereq::{holds, lookup_action};
use fablestep_rules::domain::resolution::{Resolution, resolve_step};
use fablestep_rules::domain::router::RouteAttempt;
use fablestep_story::domain::pack::{ActionDef, Node, StoryPack};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::application::runtime::StepRuntime;
use crate::domain::aggregates::{Session, status_for};
use crate::domain::commands::SubmitStep;

const RECAP_NOTES: usize = 5;

/// Receives progress of a running step.
///
/// The non-streaming handler ignores progress; the streaming executor
/// forwards it to the consumer and reports the consumer going away.
#[async_trait]
pub trait StepObserver: Send + Sync {
    /// A pipeline stage began.
    async fn phase(&mut self, phase: StepPhase) -> Result<(), DomainError>;

    /// Scrubbed narration text is ready.
    async fn delta(&mut self, text: String) -> Result<(), DomainError>;

    /// Resolves once the consumer has gone away. Never resolves for a
    /// consumer that cannot leave.
    async fn cancelled(&self);

    /// Called right before the commit; an error aborts the step.
    async fn before_commit(&mut self) -> Result<(), DomainError>;
}

/// Observer for callers that only want the final result.
#[derive(Debug, Default)]
pub struct SilentObserver;

#[async_trait]
impl StepObserver for SilentObserver {
    async fn phase(&mut self, _phase: StepPhase) -> Result<(), DomainError> {
        Ok(())
    }

    async fn delta(&mut self, _text: String) -> Result<(), DomainError> {
        Ok(())
    }

    async fn cancelled(&self) {
        futures::future::pending::<()>().await;
    }

    async fn before_commit(&mut self) -> Result<(), DomainError> {
        Ok(())
    }
}

/// What a submission returned.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// The committed result.
    pub result: StepResult,
    /// The result exactly as stored under the idempotency key. Fresh and
    /// replayed responses are both rendered from this value.
    pub body: serde_json::Value,
    /// Whether the result came from the idempotency cache.
    pub replayed: bool,
}

#[derive(Debug, Serialize)]
struct StepDiagnostics<'a> {
    selection: &'a SelectionDiagnostics,
    route_attempts: &'a [RouteAttempt],
    fallback_count: u32,
}

/// Claims the key, runs the pipeline and commits.
///
/// # Errors
///
/// Returns `MissingIdempotencyKey` or `InputConflict` before anything is
/// recorded; `RequestInProgress` or `IdempotencyKeyReused` from the claim;
/// and any pipeline or commit error after marking the key `failed`.
pub async fn submit(
    command: &SubmitStep,
    runtime: &StepRuntime,
    observer: &mut dyn StepObserver,
) -> Result<StepOutcome, DomainError> {
    let key = command.idempotency_key.as_str();
    if key.trim().is_empty() {
        return Err(DomainError::MissingIdempotencyKey);
    }
    let input = command.payload.input()?;
    let fingerprint = command.payload.fingerprint();

    let claim = runtime
        .repo
        .claim_idempotency_key(key, command.session_id, &fingerprint, runtime.clock.now())
        .await?;
    match claim {
        KeyClaim::Claimed => debug!("idempotency key claimed"),
        KeyClaim::InProgress => return Err(DomainError::RequestInProgress(key.to_owned())),
        KeyClaim::Mismatch => return Err(DomainError::IdempotencyKeyReused(key.to_owned())),
        KeyClaim::Replay(body) => {
            info!("replaying stored step result");
            let result = serde_json::from_value(body.clone()).map_err(|e| {
                DomainError::Infrastructure(format!("stored step result is unreadable: {e}"))
            })?;
            return Ok(StepOutcome {
                result,
                body,
                replayed: true,
            });
        }
    }

    match execute(command, &input, runtime, observer).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            release_key(runtime, key, &err).await;
            Err(err)
        }
    }
}

async fn release_key(runtime: &StepRuntime, key: &str, err: &DomainError) {
    match err {
        DomainError::StreamAborted => info!("stream cancelled before the final result"),
        DomainError::ConcurrencyConflict { .. } => info!(%err, "lost the version check"),
        DomainError::ModelUnavailable(_) => error!(%err, "step discarded"),
        _ => debug!(%err, "step failed"),
    }
    if let Err(mark_err) = runtime
        .repo
        .fail_idempotency_key(key, err.code(), runtime.clock.now())
        .await
    {
        warn!(%mark_err, "could not mark idempotency key failed");
    }
}

async fn execute(
    command: &SubmitStep,
    input: &StepInput,
    runtime: &StepRuntime,
    observer: &mut dyn StepObserver,
) -> Result<StepOutcome, DomainError> {
    let record = runtime
        .repo
        .load_session(command.session_id)
        .await?
        .ok_or(DomainError::SessionNotFound(command.session_id))?;
    let session = Session::from_record(&record)?;
    session.ensure_active()?;

    let pack = runtime
        .catalog
        .load(&session.story_id, session.story_version)
        .await?;
    let node = pack.node(&session.state.node_id).ok_or_else(|| {
        DomainError::Infrastructure(format!(
            "session is at unknown node {}",
            session.state.node_id
        ))
    })?;

    observer.phase(StepPhase::Accepted).await?;
    observer.phase(StepPhase::Selecting).await?;
    let state = &session.state;
    let is_unlocked = |action: &ActionDef| holds(&pack, state, &action.requires);
    let selection = Selector::new(runtime.policy.clone())
        .select(
            SelectionContext {
                pack: &pack,
                node,
                is_unlocked: &is_unlocked,
            },
            input,
            runtime.mapper.as_ref(),
        )
        .await?;
    debug!(target_id = %selection.target.id, kind = ?selection.target.kind, "target selected");

    observer.phase(StepPhase::Resolving).await?;
    let resolution = resolve_step(
        &pack,
        &runtime.policy,
        session.id,
        state,
        &selection.target,
        &selection.extension_ops,
    )?;
    debug!(disposition = ?resolution.disposition, "step resolved");

    observer.phase(StepPhase::Narrating).await?;
    let scrubber = Scrubber::new(pack.internal_ids());
    let request = narration_request(&pack, node, &resolution, input, runtime);
    let narrative = narrate(runtime, &request, &scrubber, observer).await?;
    let ending = match resolution.ending {
        Some(ending) => {
            let epilogue = write_epilogue(
                runtime,
                &EpilogueRequest {
                    story_title: pack.title.clone(),
                    ending_title: ending.title.clone(),
                    outcome: ending.outcome.as_str().to_owned(),
                    forced_by_timeout: resolution.forced_by_timeout,
                    recap: recap(&resolution),
                },
                &scrubber,
            )
            .await?;
            Some(EndingSummary {
                id: ending.id.clone(),
                outcome: ending.outcome.as_str().to_owned(),
                title: ending.title.clone(),
                epilogue,
                forced_by_timeout: resolution.forced_by_timeout,
            })
        }
        None => None,
    };

    let step_index = session.next_step_index();
    let state_after = resolution.state.to_value();
    let state_delta = resolution.delta.to_value();
    let diagnostics = serde_json::to_value(StepDiagnostics {
        selection: &selection.diagnostics,
        route_attempts: &resolution.attempts,
        fallback_count: resolution.state.run_state.fallback_count,
    })
    .expect("StepDiagnostics serialization is infallible");
    let status = status_for(&resolution.state);
    let result = StepResult {
        session_id: session.id,
        idempotency_key: command.idempotency_key.clone(),
        step_index,
        version: step_index,
        status,
        node_id: resolution.state.node_id.clone(),
        resolved_target: resolution.target.clone(),
        disposition: resolution.disposition,
        narrative,
        state: state_after.clone(),
        state_delta: state_delta.clone(),
        ending,
        diagnostics: diagnostics.clone(),
    };
    let body = serde_json::to_value(&result).expect("StepResult serialization is infallible");

    observer.phase(StepPhase::Committing).await?;
    observer.before_commit().await?;
    let now = runtime.clock.now();
    let commit = StepCommit {
        session_id: session.id,
        expected_version: session.version,
        state: state_after.clone(),
        status,
        log_entry: ActionLogEntry {
            session_id: session.id,
            step_index,
            input: serde_json::to_value(&command.payload)
                .expect("StepPayload serialization is infallible"),
            resolved_target: serde_json::to_value(&resolution.target)
                .expect("ResolvedTarget serialization is infallible"),
            state_before: record.state,
            state_delta,
            state_after,
            diagnostics,
            committed_at: now,
        },
        idempotency_key: command.idempotency_key.clone(),
        result: body.clone(),
    };
    runtime.repo.commit_step(&commit).await?;
    info!(step_index, ?status, "step committed");

    Ok(StepOutcome {
        result,
        body,
        replayed: false,
    })
}

fn narration_request(
    pack: &StoryPack,
    node: &Node,
    resolution: &Resolution<'_>,
    input: &StepInput,
    runtime: &StepRuntime,
) -> NarrationRequest {
    let action_label = if resolution.disposition == RouteDisposition::Degraded {
        String::new()
    } else {
        lookup_action(pack, node, &resolution.target)
            .map(|action| action.label.clone())
            .unwrap_or_default()
    };
    let player_input = match input {
        StepInput::FreeText(text) => {
            match InputPolicyGate::new(runtime.policy.max_input_chars).screen(text) {
                GateVerdict::Accepted { normalized } => Some(normalized),
                GateVerdict::Empty | GateVerdict::Rejected(_) => None,
            }
        }
        StepInput::None | StepInput::Choice(_) => None,
    };
    NarrationRequest {
        story_title: pack.title.clone(),
        scene: scene_text(pack, node),
        next_scene: pack
            .node(&resolution.state.node_id)
            .map(|next| scene_text(pack, next))
            .unwrap_or_default(),
        action_label,
        disposition: resolution.disposition,
        player_input,
        stat_changes: resolution
            .delta
            .stats
            .iter()
            .map(|(stat, change)| (stat.clone(), *change))
            .collect(),
        event_text: resolution.delta.event.as_ref().map(|e| e.text.clone()),
    }
}

fn recap(resolution: &Resolution<'_>) -> Vec<String> {
    let notes = &resolution.state.quest_state.recent_events;
    notes
        .iter()
        .skip(notes.len().saturating_sub(RECAP_NOTES))
        .cloned()
        .collect()
}

fn model_unavailable(failure: &ModelFailure) -> DomainError {
    DomainError::ModelUnavailable(failure.to_string())
}

/// Streams narration through the scrubber, forwarding each safe fragment.
async fn narrate(
    runtime: &StepRuntime,
    request: &NarrationRequest,
    scrubber: &Scrubber,
    observer: &mut dyn StepObserver,
) -> Result<String, DomainError> {
    let mut stream = runtime
        .narrator
        .narrate(request)
        .await
        .into_result()
        .map_err(|f| model_unavailable(&f))?;
    let mut scrub = StreamScrubber::new(scrubber);
    let mut text = String::new();

    loop {
        let next = tokio::select! {
            chunk = stream.next() => chunk,
            () = observer.cancelled() => return Err(DomainError::StreamAborted),
        };
        let Some(chunk) = next else { break };
        let clean = scrub.push(&chunk.map_err(|f| model_unavailable(&f))?);
        if !clean.is_empty() {
            text.push_str(&clean);
            observer.delta(clean).await?;
        }
    }
    let tail = scrub.finish();
    if !tail.is_empty() {
        text.push_str(&tail);
        observer.delta(tail).await?;
    }

    if text.trim().is_empty() {
        return Err(DomainError::ModelUnavailable(
            "narration produced no text".to_owned(),
        ));
    }
    Ok(text)
}

async fn write_epilogue(
    runtime: &StepRuntime,
    request: &EpilogueRequest,
    scrubber: &Scrubber,
) -> Result<String, DomainError> {
    let raw = runtime
        .narrator
        .epilogue(request)
        .await
        .into_result()
        .map_err(|f| model_unavailable(&f))?;
    let epilogue = scrubber.scrub(&raw);
    if epilogue.trim().is_empty() {
        return Err(DomainError::ModelUnavailable(
            "epilogue produced no text".to_owned(),
        ));
    }
    Ok(epilogue)
}
