//! Structural validation of a published pack.
//!
//! A pack that passes validation never produces a dangling reference at
//! runtime; the runtime still treats unresolved references as `INVALID_SPEC`.

use std::collections::BTreeSet;

use fablestep_core::error::DomainError;

use super::condition::Condition;
use super::effects::{EffectOp, EffectSpec};
use super::pack::{MilestoneTrigger, StoryPack};

impl StoryPack {
    /// Validates references, uniqueness and bounds.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` listing every issue found.
    pub fn validate(&self) -> Result<(), DomainError> {
        let issues = collect_issues(self);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Validation(format!(
                "story pack {}@{} is invalid: {}",
                self.story_id,
                self.version,
                issues.join("; ")
            )))
        }
    }
}

fn duplicates<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = BTreeSet::new();
    let mut dupes = Vec::new();
    for id in ids {
        if !seen.insert(id) {
            dupes.push(id);
        }
    }
    dupes
}

fn collect_issues(pack: &StoryPack) -> Vec<String> {
    let mut issues = Vec::new();

    for dupe in duplicates(pack.nodes.iter().map(|n| n.id.as_str())) {
        issues.push(format!("duplicate node {dupe}"));
    }
    for dupe in duplicates(pack.fallback_executors.iter().map(|e| e.id.as_str())) {
        issues.push(format!("duplicate fallback executor {dupe}"));
    }
    for dupe in duplicates(pack.stats.iter().map(|s| s.id.as_str())) {
        issues.push(format!("duplicate stat {dupe}"));
    }
    for dupe in duplicates(pack.quests.iter().map(|q| q.id.as_str())) {
        issues.push(format!("duplicate quest {dupe}"));
    }
    for dupe in duplicates(pack.events.iter().map(|e| e.id.as_str())) {
        issues.push(format!("duplicate event {dupe}"));
    }
    for dupe in duplicates(pack.endings.iter().map(|e| e.id.as_str())) {
        issues.push(format!("duplicate ending {dupe}"));
    }

    if pack.node(&pack.start_node).is_none() {
        issues.push(format!("start node {} does not exist", pack.start_node));
    }

    for stat in &pack.stats {
        if stat.min > stat.max || stat.initial < stat.min || stat.initial > stat.max {
            issues.push(format!(
                "stat {} must satisfy min <= initial <= max",
                stat.id
            ));
        }
    }

    let policy = &pack.fallback_policy;
    for executor in std::iter::once(&policy.default).chain(
        [
            &policy.low_confidence,
            &policy.no_match,
            &policy.input_rejected,
            &policy.no_input,
            &policy.policy_flagged,
        ]
        .into_iter()
        .flatten(),
    ) {
        if pack.executor(executor).is_none() {
            issues.push(format!("fallback policy names unknown executor {executor}"));
        }
    }

    for node in &pack.nodes {
        let choice_ids = node.choices.iter().map(|c| c.id.as_str());
        for dupe in duplicates(choice_ids.chain(node.intents.iter().map(|i| i.id.as_str()))) {
            issues.push(format!("node {} reuses id {dupe}", node.id));
        }
        if let Some(fallback) = &node.fallback {
            if pack.executor(fallback).is_none() {
                issues.push(format!("node {} falls back to unknown executor {fallback}", node.id));
            }
        }
        for choice in &node.choices {
            check_action(pack, &format!("choice {}.{}", node.id, choice.id), choice, &mut issues);
            if let Some(fallback) = &choice.fallback {
                if pack.executor(fallback).is_none() {
                    issues.push(format!(
                        "choice {}.{} falls back to unknown executor {fallback}",
                        node.id, choice.id
                    ));
                }
            }
        }
        for intent in &node.intents {
            if node.choice(&intent.maps_to).is_none() && pack.executor(&intent.maps_to).is_none() {
                issues.push(format!(
                    "intent {}.{} maps to unknown target {}",
                    node.id, intent.id, intent.maps_to
                ));
            }
            let context = format!("intent {}.{}", node.id, intent.id);
            check_ops(pack, &context, &intent.extra_ops, &mut issues);
        }
    }

    for executor in &pack.fallback_executors {
        check_action(pack, &format!("executor {}", executor.id), executor, &mut issues);
    }

    for quest in &pack.quests {
        if quest.stages.is_empty() {
            issues.push(format!("quest {} has no stages", quest.id));
        }
        for stage in &quest.stages {
            if stage.milestones.is_empty() {
                issues.push(format!("quest {} stage {} has no milestones", quest.id, stage.id));
            }
            for milestone in &stage.milestones {
                let context = format!("milestone {}.{}.{}", quest.id, stage.id, milestone.id);
                match &milestone.trigger {
                    MilestoneTrigger::EnterNode { node } | MilestoneTrigger::LeaveNode { node } => {
                        if pack.node(node).is_none() {
                            issues.push(format!("{context} names unknown node {node}"));
                        }
                    }
                    MilestoneTrigger::StatDelta { stat, .. } => {
                        if pack.stat(stat).is_none() {
                            issues.push(format!("{context} names unknown stat {stat}"));
                        }
                    }
                    MilestoneTrigger::State { condition } => {
                        let conditions = std::slice::from_ref(condition);
                        check_conditions(pack, &context, conditions, &mut issues);
                    }
                    MilestoneTrigger::ExecuteTarget { .. } => {}
                }
            }
            let context = format!("quest {} stage {}", quest.id, stage.id);
            check_effects(pack, &context, &stage.reward, &mut issues);
        }
        check_effects(pack, &format!("quest {}", quest.id), &quest.completion_reward, &mut issues);
    }

    for event in &pack.events {
        let context = format!("event {}", event.id);
        if event.weight == 0 {
            issues.push(format!("{context} has zero weight"));
        }
        check_conditions(pack, &context, &event.pre, &mut issues);
        check_conditions(pack, &context, &event.post, &mut issues);
        check_effects(pack, &context, &event.effects, &mut issues);
    }

    for ending in &pack.endings {
        check_conditions(pack, &format!("ending {}", ending.id), &ending.trigger, &mut issues);
    }

    if let Some(timeout) = &pack.timeout {
        if pack.ending(&timeout.ending_id).is_none() {
            issues.push(format!("timeout names unknown ending {}", timeout.ending_id));
        }
        if timeout.max_days.is_none() && timeout.max_steps.is_none() {
            issues.push("timeout sets neither max_days nor max_steps".to_owned());
        }
    }

    issues
}

fn check_action(
    pack: &StoryPack,
    context: &str,
    action: &super::pack::ActionDef,
    issues: &mut Vec<String>,
) {
    if let Some(next) = &action.next_node {
        if pack.node(next).is_none() {
            issues.push(format!("{context} moves to unknown node {next}"));
        }
    }
    check_conditions(pack, context, &action.requires, issues);
    check_effects(pack, context, &action.effects, issues);
}

fn check_conditions(
    pack: &StoryPack,
    context: &str,
    conditions: &[Condition],
    issues: &mut Vec<String>,
) {
    for condition in conditions {
        for stat in condition.referenced_stats() {
            if pack.stat(stat).is_none() {
                issues.push(format!("{context} tests unknown stat {stat}"));
            }
        }
    }
}

fn check_effects(pack: &StoryPack, context: &str, effects: &EffectSpec, issues: &mut Vec<String>) {
    for effect in &effects.stats {
        if pack.stat(&effect.stat).is_none() {
            issues.push(format!("{context} changes unknown stat {}", effect.stat));
        }
    }
    check_ops(pack, context, &effects.ops, issues);
}

fn check_ops(pack: &StoryPack, context: &str, ops: &[EffectOp], issues: &mut Vec<String>) {
    for op in ops {
        if let EffectOp::StartQuest { quest } = op {
            if pack.quest(quest).is_none() {
                issues.push(format!("{context} starts unknown quest {quest}"));
            }
        }
    }
}
