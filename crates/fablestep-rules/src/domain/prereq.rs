//! Prerequisite evaluation.
//!
//! Conditions are evaluated against a session state. A condition that cannot
//! be evaluated because the pack references something that does not exist is
//! reported as `InvalidSpec`, never silently treated as false.

use fablestep_core::step::{ResolvedTarget, TargetKind};
use fablestep_story::domain::condition::Condition;
use fablestep_story::domain::pack::{ActionDef, Node, StoryPack};
use serde::Serialize;

use super::state::SessionState;

/// Result of evaluating a set of prerequisites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PrereqOutcome {
    /// Every condition holds.
    Ok,
    /// At least one condition does not hold.
    Blocked { unmet: Vec<String> },
    /// The pack references something that does not exist.
    InvalidSpec { reason: String },
}

impl PrereqOutcome {
    /// Whether the target may execute.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Evaluates one condition.
///
/// # Errors
///
/// Returns the reason as `Err` when the condition references an undeclared
/// stat, quest or node.
pub fn evaluate_condition(
    pack: &StoryPack,
    state: &SessionState,
    condition: &Condition,
) -> Result<bool, String> {
    let held = match condition {
        Condition::StatAtLeast { stat, value } => stat_value(state, stat)? >= *value,
        Condition::StatAtMost { stat, value } => stat_value(state, stat)? <= *value,
        Condition::HasItem { item, quantity } => state.inventory.has_item(item, *quantity),
        Condition::FlagSet { flag } => state.external_status.flag(flag),
        Condition::FlagUnset { flag } => !state.external_status.flag(flag),
        Condition::CurrencyAtLeast { amount } => state.inventory.currency >= *amount,
        Condition::ReputationAtLeast { faction, value } => {
            state
                .external_status
                .reputation
                .get(faction)
                .copied()
                .unwrap_or(0)
                >= *value
        }
        Condition::NpcRelationAtLeast { npc, value } => state
            .npc_state
            .npcs
            .get(npc)
            .is_some_and(|record| record.relation >= *value),
        Condition::QuestActive { quest } => {
            known_quest(pack, quest)?;
            state.quest_state.active.contains(quest)
        }
        Condition::QuestCompleted { quest } => {
            known_quest(pack, quest)?;
            state.quest_state.completed.contains(quest)
        }
        Condition::AtNode { node } => {
            if pack.node(node).is_none() {
                return Err(format!("condition names unknown node {node}"));
            }
            state.node_id == *node
        }
        Condition::StepAtLeast { step } => state.run_state.step_index >= *step,
        Condition::DayAtLeast { day } => state.run_state.day >= *day,
        Condition::StatusActive { status } => state.external_status.has_status(status),
        Condition::Any { of } => {
            let mut any = false;
            for nested in of {
                any |= evaluate_condition(pack, state, nested)?;
            }
            any
        }
        Condition::Not { condition } => !evaluate_condition(pack, state, condition)?,
    };
    Ok(held)
}

fn stat_value(state: &SessionState, stat: &str) -> Result<i64, String> {
    state
        .stat(stat)
        .ok_or_else(|| format!("condition names unknown stat {stat}"))
}

fn known_quest(pack: &StoryPack, quest: &str) -> Result<(), String> {
    pack.quest(quest)
        .map(|_| ())
        .ok_or_else(|| format!("condition names unknown quest {quest}"))
}

/// Evaluates every condition; all must hold.
#[must_use]
pub fn evaluate_all(
    pack: &StoryPack,
    state: &SessionState,
    conditions: &[Condition],
) -> PrereqOutcome {
    let mut unmet = Vec::new();
    for condition in conditions {
        match evaluate_condition(pack, state, condition) {
            Ok(true) => {}
            Ok(false) => unmet.push(describe(condition)),
            Err(reason) => return PrereqOutcome::InvalidSpec { reason },
        }
    }
    if unmet.is_empty() {
        PrereqOutcome::Ok
    } else {
        PrereqOutcome::Blocked { unmet }
    }
}

/// Whether every condition holds; invalid references count as not holding.
#[must_use]
pub fn holds(pack: &StoryPack, state: &SessionState, conditions: &[Condition]) -> bool {
    evaluate_all(pack, state, conditions).is_ok()
}

/// Looks up the action a resolved target names at `node`.
#[must_use]
pub fn lookup_action<'a>(
    pack: &'a StoryPack,
    node: &'a Node,
    target: &ResolvedTarget,
) -> Option<&'a ActionDef> {
    match target.kind {
        TargetKind::Visible => node.choice(&target.id),
        TargetKind::Fallback => pack.executor(&target.id),
    }
}

/// Evaluates the prerequisites of `target` at `node`.
///
/// A target that names no action is `InvalidSpec`.
#[must_use]
pub fn evaluate_target(
    pack: &StoryPack,
    state: &SessionState,
    node: &Node,
    target: &ResolvedTarget,
) -> PrereqOutcome {
    match lookup_action(pack, node, target) {
        Some(action) => evaluate_all(pack, state, &action.requires),
        None => PrereqOutcome::InvalidSpec {
            reason: format!("target {} does not exist at node {}", target.id, node.id),
        },
    }
}

fn describe(condition: &Condition) -> String {
    match serde_json::to_value(condition) {
        Ok(value) => value
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("condition")
            .to_owned(),
        Err(_) => "condition".to_owned(),
    }
}
