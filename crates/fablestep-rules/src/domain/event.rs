//! Event engine.
//!
//! Eligible events are drawn by weight with a generator seeded from the step
//! coordinates `(session_id, step_index, node_id)`, so replaying a step
//! always draws the same event.

use fablestep_core::rng::{DeterministicRng, SeededRng};
use fablestep_story::domain::pack::{EventDef, StoryPack};
use tracing::debug;
use uuid::Uuid;

use super::prereq::holds;
use super::state::SessionState;
use super::transition::{FiredEvent, StateDelta, apply_effect_spec};

/// Generator for the event draw of a step.
#[must_use]
pub fn step_rng(session_id: Uuid, step_index: i64, node_id: &str) -> SeededRng {
    SeededRng::from_parts(&[&session_id.to_string(), &step_index.to_string(), node_id])
}

/// Events eligible for the step, in pack order.
///
/// `before` is the state the step started from and `after` the state after
/// the transition. An event whose cooldown is still running is excluded, so a
/// cooldown of `n` blocks the `n` steps after the one that fired it.
#[must_use]
pub fn eligible_events<'a>(
    pack: &'a StoryPack,
    before: &SessionState,
    after: &SessionState,
) -> Vec<&'a EventDef> {
    pack.events
        .iter()
        .filter(|event| {
            !after.run_state.cooldowns.contains_key(&event.id)
                && !(event.once_per_run && after.run_state.triggered_events.contains(&event.id))
                && holds(pack, before, &event.pre)
                && holds(pack, after, &event.post)
        })
        .collect()
}

/// Counts every running cooldown down by one step.
pub fn tick_cooldowns(state: &mut SessionState) {
    state.run_state.cooldowns.retain(|_, remaining| {
        *remaining = remaining.saturating_sub(1);
        *remaining > 0
    });
}

/// Draws at most one eligible event, applies it, then counts cooldowns down.
#[must_use]
pub fn draw_event(
    pack: &StoryPack,
    before: &SessionState,
    mut after: SessionState,
    rng: &mut dyn DeterministicRng,
    ring_cap: usize,
    delta: &mut StateDelta,
) -> SessionState {
    let eligible = eligible_events(pack, before, &after);
    tick_cooldowns(&mut after);

    let total: u32 = eligible.iter().map(|e| e.weight).sum();
    if total == 0 {
        return after;
    }

    let mut roll = rng.next_u32_range(0, total - 1);
    let Some(event) = eligible.into_iter().find(|event| {
        if roll < event.weight {
            true
        } else {
            roll -= event.weight;
            false
        }
    }) else {
        return after;
    };

    debug!(event = %event.id, "event fired");
    after.run_state.triggered_events.insert(event.id.clone());
    if event.cooldown_steps > 0 {
        after
            .run_state
            .cooldowns
            .insert(event.id.clone(), event.cooldown_steps);
    }
    after
        .quest_state
        .record(format!("event:{}", event.id), ring_cap);
    delta.event = Some(FiredEvent {
        id: event.id.clone(),
        text: event.text.clone(),
    });
    apply_effect_spec(
        pack,
        after,
        &event.effects,
        0,
        &format!("event:{}", event.id),
        delta,
    )
}
