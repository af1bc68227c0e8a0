//! Transition engine.
//!
//! One in-memory pass per step: advance the run clock, move the node
//! pointer, apply scalar stat deltas scaled by the effective tier, then apply
//! the merged structured patch transactionally. NPC hot memory is compacted
//! afterwards. Every function here maps a state to a new state; nothing
//! outside the returned value is touched.

use std::collections::BTreeMap;

use fablestep_core::config::StepPolicy;
use fablestep_core::step::{ResolvedTarget, TargetKind};
use fablestep_story::domain::effects::{EffectOp, EffectSpec, StatEffect};
use fablestep_story::domain::pack::{ActionDef, StoryPack};
use serde::Serialize;
use tracing::{debug, warn};

use super::quest::QuestProgress;
use super::state::{
    ColdMemoryRef, NPC_RELATION_MAX, NPC_RELATION_MIN, SessionState, TimedEffect, day_for,
};

const COLD_SUMMARY_CHARS: usize = 120;

/// A structured patch that was rejected as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRejection {
    /// What produced the patch (`action`, `stage:<quest>/<stage>`, `event:<id>`).
    pub source: String,
    /// Index of the failing operation.
    pub op_index: usize,
    /// Why it failed.
    pub reason: String,
}

/// An event that fired during the step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FiredEvent {
    /// Event id.
    pub id: String,
    /// Narration hint.
    pub text: String,
}

/// Everything a step changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateDelta {
    /// Node before the step.
    pub from_node: String,
    /// Node after the step.
    pub to_node: String,
    /// Tier used to scale stat effects.
    pub effective_tier: i8,
    /// Net change per stat, after clamping. Zero changes are omitted.
    pub stats: BTreeMap<String, i64>,
    /// Structured operations applied, in order.
    pub ops: Vec<EffectOp>,
    /// Patches rejected as a whole.
    pub rejected_patches: Vec<PatchRejection>,
    /// Timed statuses that expired this step.
    pub expired_statuses: Vec<String>,
    /// NPCs whose hot memory was compacted.
    pub compacted_npcs: Vec<String>,
    /// Quest progress made.
    pub quests: Vec<QuestProgress>,
    /// Event that fired.
    pub event: Option<FiredEvent>,
    /// Ending reached.
    pub ending: Option<String>,
}

impl StateDelta {
    /// Whether the action itself changed nothing: no stat change, no
    /// operation and no node move.
    #[must_use]
    pub fn is_action_noop(&self) -> bool {
        self.stats.is_empty() && self.ops.is_empty() && self.from_node == self.to_node
    }

    /// Serializes the delta for the step result.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("StateDelta serialization is infallible")
    }

    fn record_stat(&mut self, stat: &str, change: i64) {
        if change == 0 {
            return;
        }
        let entry = self.stats.entry(stat.to_owned()).or_insert(0);
        *entry += change;
        if *entry == 0 {
            self.stats.remove(stat);
        }
    }
}

/// What the router decided to execute.
#[derive(Debug, Clone, Copy)]
pub struct TransitionInput<'a> {
    /// Action to execute; `None` degrades to a no-op.
    pub action: Option<&'a ActionDef>,
    /// Target the action was reached through.
    pub target: &'a ResolvedTarget,
    /// Extension operations merged after the action's own.
    pub extension_ops: &'a [EffectOp],
}

/// Effective tier: fallback paths add the base penalty before clamping.
#[must_use]
pub fn effective_tier(kind: TargetKind, mapper_tier: i8, base_penalty: i8) -> i8 {
    let tier = match kind {
        TargetKind::Visible => i16::from(mapper_tier),
        TargetKind::Fallback => i16::from(base_penalty) + i16::from(mapper_tier),
    };
    // The clamp keeps the value inside i8 range.
    i8::try_from(tier.clamp(-2, 2)).unwrap_or(0)
}

/// Applies a transition to `state`, returning the new state and its delta.
#[must_use]
pub fn apply_transition(
    pack: &StoryPack,
    policy: &StepPolicy,
    state: &SessionState,
    input: &TransitionInput<'_>,
) -> (SessionState, StateDelta) {
    let mut next = state.clone();
    let mut delta = StateDelta {
        from_node: state.node_id.clone(),
        ..StateDelta::default()
    };

    next.run_state.step_index += 1;
    next.run_state.day = day_for(pack, next.run_state.step_index);

    if input.target.kind == TargetKind::Fallback || input.action.is_none() {
        next.run_state.fallback_count += 1;
    }

    // A degraded step only advances the clock.
    if let Some(action) = input.action {
        delta.expired_statuses = tick_statuses(&mut next);
        let tier = effective_tier(
            input.target.kind,
            input.target.intensity_tier,
            policy.fallback_base_penalty,
        );
        delta.effective_tier = tier;

        if let Some(next_node) = &action.next_node {
            next.node_id.clone_from(next_node);
        }
        apply_stat_effects(pack, &mut next, &action.effects.stats, tier, &mut delta);

        let patch: Vec<EffectOp> = action
            .effects
            .ops
            .iter()
            .chain(input.extension_ops)
            .cloned()
            .collect();
        next = apply_patch(pack, next, &patch, "action", &mut delta);
    }

    delta.compacted_npcs = compact_npc_memory(&mut next, policy.npc_hot_memory_limit);
    delta.to_node.clone_from(&next.node_id);
    (next, delta)
}

/// Applies an effect spec at `tier` and records the changes in `delta`.
/// Used for quest rewards and event effects.
#[must_use]
pub fn apply_effect_spec(
    pack: &StoryPack,
    mut state: SessionState,
    spec: &EffectSpec,
    tier: i8,
    source: &str,
    delta: &mut StateDelta,
) -> SessionState {
    apply_stat_effects(pack, &mut state, &spec.stats, tier, delta);
    apply_patch(pack, state, &spec.ops, source, delta)
}

fn apply_stat_effects(
    pack: &StoryPack,
    state: &mut SessionState,
    effects: &[StatEffect],
    tier: i8,
    delta: &mut StateDelta,
) {
    for effect in effects {
        let (Some(def), Some(current)) =
            (pack.stat(&effect.stat), state.stats.get_mut(&effect.stat))
        else {
            warn!(stat = %effect.stat, "stat effect names an undeclared stat; skipped");
            continue;
        };
        let before = *current;
        *current = def.clamp(before + effect.delta_at(tier));
        delta.record_stat(&effect.stat, *current - before);
    }
}

/// Applies `ops` in order to a copy of `state`. If any operation fails, the
/// original state is returned unchanged and the rejection is recorded.
fn apply_patch(
    pack: &StoryPack,
    state: SessionState,
    ops: &[EffectOp],
    source: &str,
    delta: &mut StateDelta,
) -> SessionState {
    if ops.is_empty() {
        return state;
    }
    let mut staged = state.clone();
    for (index, op) in ops.iter().enumerate() {
        if let Err(reason) = apply_op(pack, &mut staged, op) {
            debug!(source, op_index = index, %reason, "structured patch rejected");
            delta.rejected_patches.push(PatchRejection {
                source: source.to_owned(),
                op_index: index,
                reason,
            });
            return state;
        }
    }
    delta.ops.extend_from_slice(ops);
    staged
}

fn ensure_capacity(state: &SessionState, adding: u32) -> Result<(), String> {
    let load = state.inventory.load() + u64::from(adding);
    if load > u64::from(state.inventory.capacity) {
        return Err(format!(
            "inventory capacity {} exceeded",
            state.inventory.capacity
        ));
    }
    Ok(())
}

/// Applies one structured operation.
///
/// # Errors
///
/// Returns the failure reason; `state` may be partially modified and must be
/// discarded by the caller.
pub fn apply_op(pack: &StoryPack, state: &mut SessionState, op: &EffectOp) -> Result<(), String> {
    match op {
        EffectOp::AddItem { item, quantity } => {
            ensure_capacity(state, *quantity)?;
            *state.inventory.stacks.entry(item.clone()).or_insert(0) += quantity;
        }
        EffectOp::RemoveItem { item, quantity } => {
            let held = state.inventory.stacks.get(item).copied().unwrap_or(0);
            if held < *quantity {
                return Err(format!("cannot remove {quantity} {item}; {held} held"));
            }
            if held == *quantity {
                state.inventory.stacks.remove(item);
            } else {
                state.inventory.stacks.insert(item.clone(), held - quantity);
            }
        }
        EffectOp::AddInstance { instance_id, item } => {
            if state.inventory.instances.contains_key(instance_id) {
                return Err(format!("instance {instance_id} already held"));
            }
            ensure_capacity(state, 1)?;
            state
                .inventory
                .instances
                .insert(instance_id.clone(), item.clone());
        }
        EffectOp::RemoveInstance { instance_id } => {
            if state.inventory.instances.remove(instance_id).is_none() {
                return Err(format!("instance {instance_id} not held"));
            }
            state
                .inventory
                .equipment
                .retain(|_, equipped| equipped != instance_id);
        }
        EffectOp::Equip { slot, instance_id } => {
            if !state.inventory.instances.contains_key(instance_id) {
                return Err(format!("cannot equip {instance_id}; not held"));
            }
            state
                .inventory
                .equipment
                .retain(|_, equipped| equipped != instance_id);
            state
                .inventory
                .equipment
                .insert(slot.clone(), instance_id.clone());
        }
        EffectOp::Unequip { slot } => {
            state.inventory.equipment.remove(slot);
        }
        EffectOp::AdjustCurrency { amount } => {
            let balance = state.inventory.currency + amount;
            if balance < 0 {
                return Err(format!(
                    "currency overdraft: {} {amount:+}",
                    state.inventory.currency
                ));
            }
            state.inventory.currency = balance;
        }
        EffectOp::SetFlag { flag, value } => {
            state.external_status.world_flags.insert(flag.clone(), *value);
        }
        EffectOp::AdjustReputation { faction, delta } => {
            *state
                .external_status
                .reputation
                .entry(faction.clone())
                .or_insert(0) += delta;
        }
        EffectOp::ApplyStatus { status, duration } => {
            if *duration == 0 {
                return Err(format!("status {status} needs a positive duration"));
            }
            match state
                .external_status
                .effects
                .iter_mut()
                .find(|e| e.status == *status)
            {
                Some(existing) => {
                    existing.remaining_steps = existing.remaining_steps.max(*duration);
                }
                None => state.external_status.effects.push(TimedEffect {
                    status: status.clone(),
                    remaining_steps: *duration,
                }),
            }
        }
        EffectOp::ClearStatus { status } => {
            state.external_status.effects.retain(|e| e.status != *status);
        }
        EffectOp::AdjustNpc {
            npc,
            relation,
            mood,
        } => {
            let record = state.npc_state.npcs.entry(npc.clone()).or_default();
            record.relation =
                (record.relation + relation).clamp(NPC_RELATION_MIN, NPC_RELATION_MAX);
            if mood.is_some() {
                record.mood.clone_from(mood);
            }
        }
        EffectOp::NpcRemember { npc, memory } => {
            state
                .npc_state
                .npcs
                .entry(npc.clone())
                .or_default()
                .hot_memory
                .push(memory.clone());
        }
        EffectOp::NpcBelieve { npc, key, value } => {
            state
                .npc_state
                .npcs
                .entry(npc.clone())
                .or_default()
                .beliefs
                .insert(key.clone(), value.clone());
        }
        EffectOp::NpcGoal { npc, goal, done } => {
            state
                .npc_state
                .npcs
                .entry(npc.clone())
                .or_default()
                .goals
                .insert(goal.clone(), *done);
        }
        EffectOp::StartQuest { quest } => {
            if pack.quest(quest).is_none() {
                return Err(format!("unknown quest {quest}"));
            }
            state.quest_state.activate(quest);
        }
    }
    Ok(())
}

/// Decrements timed statuses and drops the expired ones.
fn tick_statuses(state: &mut SessionState) -> Vec<String> {
    let mut expired = Vec::new();
    state.external_status.effects.retain_mut(|effect| {
        effect.remaining_steps = effect.remaining_steps.saturating_sub(1);
        if effect.remaining_steps == 0 {
            expired.push(effect.status.clone());
            false
        } else {
            true
        }
    });
    expired
}

/// Moves NPC hot memory beyond `limit` entries, oldest first, into a cold
/// reference. Returns the NPCs that were compacted.
pub fn compact_npc_memory(state: &mut SessionState, limit: usize) -> Vec<String> {
    let step = state.run_state.step_index;
    let mut compacted = Vec::new();
    for (npc, record) in &mut state.npc_state.npcs {
        if record.hot_memory.len() <= limit {
            continue;
        }
        let overflow = record.hot_memory.len() - limit;
        let archived: Vec<String> = record.hot_memory.drain(..overflow).collect();
        let summary: String = archived.join("; ").chars().take(COLD_SUMMARY_CHARS).collect();
        record.cold_memory.push(ColdMemoryRef {
            ref_id: format!("{npc}:cold:{}", record.cold_memory.len() + 1),
            entries: archived.len(),
            summary,
            archived_at_step: step,
        });
        compacted.push(npc.clone());
    }
    compacted
}
