//! Fallback router.
//!
//! A blocked visible target is rerouted exactly once to its fallback
//! executor. If that is blocked too, the step degrades to a no-op. There is
//! no second reroute.

use fablestep_core::step::{ResolvedTarget, RouteDisposition, TargetKind};
use fablestep_story::domain::pack::{ActionDef, FallbackReason, Node, StoryPack};
use serde::Serialize;
use tracing::{debug, warn};

use super::prereq::{PrereqOutcome, evaluate_target, lookup_action};
use super::state::SessionState;

/// Evaluation record of one routing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteAttempt {
    /// Target evaluated.
    pub target: ResolvedTarget,
    /// Evaluation outcome.
    pub outcome: PrereqOutcome,
}

/// The routed action of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedAction<'a> {
    /// Target that executes. For a degraded step this is the last target
    /// evaluated, which does not execute.
    pub target: ResolvedTarget,
    /// Action to execute; `None` for a degraded step.
    pub action: Option<&'a ActionDef>,
    /// How the target was reached.
    pub disposition: RouteDisposition,
    /// Every evaluation performed, in order. At most two.
    pub attempts: Vec<RouteAttempt>,
}

/// Routes `selected` at `node`.
#[must_use]
pub fn route<'a>(
    pack: &'a StoryPack,
    state: &SessionState,
    node: &'a Node,
    selected: &ResolvedTarget,
) -> RoutedAction<'a> {
    let first = evaluate_target(pack, state, node, selected);
    let mut attempts = vec![RouteAttempt {
        target: selected.clone(),
        outcome: first.clone(),
    }];

    if first.is_ok() {
        return RoutedAction {
            target: selected.clone(),
            action: lookup_action(pack, node, selected),
            disposition: RouteDisposition::Executed,
            attempts,
        };
    }
    if let PrereqOutcome::InvalidSpec { reason } = &first {
        warn!(node = %node.id, target = %selected.id, %reason, "invalid spec during routing");
    }

    if selected.kind == TargetKind::Fallback {
        debug!(target = %selected.id, "fallback target blocked; degrading");
        return degraded(selected.clone(), attempts);
    }

    let reroute_id = match node.choice(&selected.id) {
        Some(choice) => pack.reroute_for(node, choice),
        None => pack.fallback_for(node, FallbackReason::Blocked),
    };
    let reroute = ResolvedTarget {
        kind: TargetKind::Fallback,
        id: reroute_id.to_owned(),
        intensity_tier: selected.intensity_tier,
    };
    let second = evaluate_target(pack, state, node, &reroute);
    attempts.push(RouteAttempt {
        target: reroute.clone(),
        outcome: second.clone(),
    });

    if second.is_ok() {
        debug!(from = %selected.id, to = %reroute.id, "rerouted to fallback");
        return RoutedAction {
            action: lookup_action(pack, node, &reroute),
            target: reroute,
            disposition: RouteDisposition::Rerouted,
            attempts,
        };
    }

    debug!(from = %selected.id, to = %reroute.id, "reroute blocked; degrading");
    degraded(reroute, attempts)
}

fn degraded<'a>(target: ResolvedTarget, attempts: Vec<RouteAttempt>) -> RoutedAction<'a> {
    RoutedAction {
        target,
        action: None,
        disposition: RouteDisposition::Degraded,
        attempts,
    }
}
