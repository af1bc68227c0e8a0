//! Ending engine.
//!
//! Endings are evaluated in `(priority asc, id asc)` order against the
//! post-step state; the first whose trigger holds wins. If none holds and the
//! run has exhausted its step or day budget, the timeout ending is forced.

use fablestep_story::domain::pack::{EndingDef, StoryPack};
use tracing::{info, warn};

use super::prereq::{PrereqOutcome, evaluate_all};
use super::state::SessionState;

/// The ending a step reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndingResolution<'a> {
    /// Ending definition.
    pub ending: &'a EndingDef,
    /// Whether the timeout policy forced it.
    pub forced_by_timeout: bool,
}

fn timed_out(pack: &StoryPack, state: &SessionState) -> bool {
    let Some(timeout) = &pack.timeout else {
        return false;
    };
    let steps_exhausted = timeout
        .max_steps
        .is_some_and(|max| state.run_state.step_index >= max);
    let days_exhausted = timeout
        .max_days
        .is_some_and(|max| pack.steps_per_day > 0 && state.run_state.day > max);
    steps_exhausted || days_exhausted
}

/// Finds the ending reached by `state`, if any.
#[must_use]
pub fn resolve_ending<'a>(
    pack: &'a StoryPack,
    state: &SessionState,
) -> Option<EndingResolution<'a>> {
    for ending in pack.endings_in_order() {
        match evaluate_all(pack, state, &ending.trigger) {
            PrereqOutcome::Ok => {
                return Some(EndingResolution {
                    ending,
                    forced_by_timeout: false,
                });
            }
            PrereqOutcome::Blocked { .. } => {}
            PrereqOutcome::InvalidSpec { reason } => {
                warn!(ending = %ending.id, %reason, "ending trigger is invalid; skipped");
            }
        }
    }

    if timed_out(pack, state) {
        let timeout = pack.timeout.as_ref()?;
        let Some(ending) = pack.ending(&timeout.ending_id) else {
            warn!(ending = %timeout.ending_id, "timeout ending is not in the pack");
            return None;
        };
        return Some(EndingResolution {
            ending,
            forced_by_timeout: true,
        });
    }
    None
}

/// Evaluates endings and records the one reached in the run state.
#[must_use]
pub fn apply_ending<'a>(
    pack: &'a StoryPack,
    mut state: SessionState,
) -> (SessionState, Option<EndingResolution<'a>>) {
    if state.is_ended() {
        return (state, None);
    }
    let resolution = resolve_ending(pack, &state);
    if let Some(resolution) = &resolution {
        info!(
            ending = %resolution.ending.id,
            forced_by_timeout = resolution.forced_by_timeout,
            "session reached an ending"
        );
        state.run_state.ending_id = Some(resolution.ending.id.clone());
        state.run_state.ending_outcome = Some(resolution.ending.outcome.as_str().to_owned());
    }
    (state, resolution)
}
