//! Deterministic half of a step: route, transition, quests, events, endings.

use fablestep_core::config::StepPolicy;
use fablestep_core::error::DomainError;
use fablestep_core::step::{ResolvedTarget, RouteDisposition};
use fablestep_story::domain::effects::EffectOp;
use fablestep_story::domain::pack::{EndingDef, StoryPack};
use uuid::Uuid;

use super::ending::apply_ending;
use super::event::{draw_event, step_rng, tick_cooldowns};
use super::quest::advance_quests;
use super::router::{RouteAttempt, route};
use super::state::SessionState;
use super::transition::{StateDelta, TransitionInput, apply_transition};

/// Everything the deterministic phases produced for a step.
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    /// State after the step.
    pub state: SessionState,
    /// Changes made by the step.
    pub delta: StateDelta,
    /// Target that executed (or, when degraded, the last one evaluated).
    pub target: ResolvedTarget,
    /// How the router disposed of the selected target.
    pub disposition: RouteDisposition,
    /// Routing evaluations, in order.
    pub attempts: Vec<RouteAttempt>,
    /// Ending reached, if any.
    pub ending: Option<&'a EndingDef>,
    /// Whether the ending was forced by the timeout policy.
    pub forced_by_timeout: bool,
}

/// Resolves a selected target against `state`.
///
/// # Errors
///
/// Returns `DomainError::Infrastructure` if the state points at a node the
/// pack does not contain.
pub fn resolve_step<'a>(
    pack: &'a StoryPack,
    policy: &StepPolicy,
    session_id: Uuid,
    state: &SessionState,
    selected: &ResolvedTarget,
    extension_ops: &[EffectOp],
) -> Result<Resolution<'a>, DomainError> {
    let node = pack.node(&state.node_id).ok_or_else(|| {
        DomainError::Infrastructure(format!("session is at unknown node {}", state.node_id))
    })?;

    let routed = route(pack, state, node, selected);
    // Extension ops belong to the selected target; a reroute drops them.
    let extension_ops = if routed.disposition == RouteDisposition::Executed {
        extension_ops
    } else {
        &[]
    };
    let (next, mut delta) = apply_transition(
        pack,
        policy,
        state,
        &TransitionInput {
            action: routed.action,
            target: &routed.target,
            extension_ops,
        },
    );

    // A degraded step leaves quests and events alone; cooldowns still count
    // the step.
    let next = if let Some(action) = routed.action {
        let cap = policy.recent_events_cap;
        let next = advance_quests(pack, next, Some(action.id.as_str()), cap, &mut delta);
        let mut rng = step_rng(session_id, next.run_state.step_index, &state.node_id);
        draw_event(pack, state, next, &mut rng, cap, &mut delta)
    } else {
        let mut next = next;
        tick_cooldowns(&mut next);
        next
    };

    let (next, resolution) = apply_ending(pack, next);
    delta.ending = resolution.as_ref().map(|r| r.ending.id.clone());

    Ok(Resolution {
        state: next,
        delta,
        target: routed.target,
        disposition: routed.disposition,
        attempts: routed.attempts,
        forced_by_timeout: resolution.as_ref().is_some_and(|r| r.forced_by_timeout),
        ending: resolution.map(|r| r.ending),
    })
}
