//! Quest engine.
//!
//! Only the milestones of a quest's active stage are evaluated. A stage
//! completes when all of its milestones have, its reward is applied, and the
//! next stage becomes active. Completing the last stage moves the quest to
//! the completed set and applies the completion reward, which can therefore
//! happen at most once per run.

use std::collections::BTreeMap;

use fablestep_story::domain::pack::{MilestoneTrigger, StoryPack};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::prereq::evaluate_condition;
use super::state::SessionState;
use super::transition::{StateDelta, apply_effect_spec};

/// Quest progress made by one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestProgress {
    /// A milestone of the active stage completed.
    MilestoneCompleted {
        quest: String,
        stage: String,
        milestone: String,
    },
    /// The active stage completed.
    StageCompleted { quest: String, stage: String },
    /// The last stage completed.
    QuestCompleted { quest: String },
}

struct Facts<'a> {
    from_node: &'a str,
    to_node: &'a str,
    executed_target: Option<&'a str>,
    stats: &'a BTreeMap<String, i64>,
}

impl Facts<'_> {
    fn moved(&self) -> bool {
        self.from_node != self.to_node
    }
}

fn triggered(
    pack: &StoryPack,
    state: &SessionState,
    facts: &Facts<'_>,
    trigger: &MilestoneTrigger,
) -> bool {
    match trigger {
        MilestoneTrigger::EnterNode { node } => facts.moved() && facts.to_node == node,
        MilestoneTrigger::LeaveNode { node } => facts.moved() && facts.from_node == node,
        MilestoneTrigger::ExecuteTarget { target } => {
            facts.executed_target == Some(target.as_str())
        }
        MilestoneTrigger::StatDelta { stat, at_least } => {
            let change = facts.stats.get(stat).copied().unwrap_or(0);
            if *at_least >= 0 {
                change >= *at_least
            } else {
                change <= *at_least
            }
        }
        MilestoneTrigger::State { condition } => match evaluate_condition(pack, state, condition) {
            Ok(held) => held,
            Err(reason) => {
                warn!(%reason, "milestone condition is invalid");
                false
            }
        },
    }
}

/// Advances active quests against the facts of the step recorded in `delta`.
///
/// `executed_target` is the id of the choice or executor that ran, if any.
#[must_use]
pub fn advance_quests(
    pack: &StoryPack,
    mut state: SessionState,
    executed_target: Option<&str>,
    ring_cap: usize,
    delta: &mut StateDelta,
) -> SessionState {
    let from_node = delta.from_node.clone();
    let to_node = delta.to_node.clone();
    let stats = delta.stats.clone();
    let facts = Facts {
        from_node: &from_node,
        to_node: &to_node,
        executed_target,
        stats: &stats,
    };

    let active: Vec<String> = state.quest_state.active.iter().cloned().collect();
    for quest_id in active {
        let Some(quest) = pack.quest(&quest_id) else {
            warn!(quest = %quest_id, "active quest is not in the pack");
            continue;
        };
        let stage_index = state.quest_state.stages.get(&quest_id).copied().unwrap_or(0);
        let Some(stage) = quest.stages.get(stage_index) else {
            continue;
        };

        let mut done = state
            .quest_state
            .milestones
            .get(&quest_id)
            .cloned()
            .unwrap_or_default();
        for milestone in &stage.milestones {
            if done.contains(&milestone.id)
                || !triggered(pack, &state, &facts, &milestone.trigger)
            {
                continue;
            }
            done.insert(milestone.id.clone());
            delta.quests.push(QuestProgress::MilestoneCompleted {
                quest: quest_id.clone(),
                stage: stage.id.clone(),
                milestone: milestone.id.clone(),
            });
        }
        let stage_complete = stage.milestones.iter().all(|m| done.contains(&m.id));
        state.quest_state.milestones.insert(quest_id.clone(), done);
        if !stage_complete {
            continue;
        }

        debug!(quest = %quest_id, stage = %stage.id, "quest stage completed");
        delta.quests.push(QuestProgress::StageCompleted {
            quest: quest_id.clone(),
            stage: stage.id.clone(),
        });
        state
            .quest_state
            .record(format!("quest:{quest_id}:stage:{}", stage.id), ring_cap);
        state = apply_effect_spec(
            pack,
            state,
            &stage.reward,
            0,
            &format!("stage:{quest_id}/{}", stage.id),
            delta,
        );

        if stage_index + 1 < quest.stages.len() {
            state.quest_state.stages.insert(quest_id.clone(), stage_index + 1);
            state
                .quest_state
                .milestones
                .insert(quest_id.clone(), Default::default());
            continue;
        }

        state.quest_state.active.remove(&quest_id);
        state.quest_state.stages.remove(&quest_id);
        state.quest_state.milestones.remove(&quest_id);
        if state.quest_state.completed.insert(quest_id.clone()) {
            debug!(quest = %quest_id, "quest completed");
            delta.quests.push(QuestProgress::QuestCompleted {
                quest: quest_id.clone(),
            });
            state
                .quest_state
                .record(format!("quest:{quest_id}:completed"), ring_cap);
            state = apply_effect_spec(
                pack,
                state,
                &quest.completion_reward,
                0,
                &format!("quest:{quest_id}"),
                delta,
            );
        }
    }
    state
}
