//! The published story pack.

use std::collections::BTreeMap;

use fablestep_core::error::DomainError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::condition::Condition;
use super::effects::{EffectOp, EffectSpec};

fn default_capacity() -> u32 {
    20
}

/// A bounded numeric stat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatDef {
    /// Stat id.
    pub id: String,
    /// Lower bound (inclusive).
    pub min: i64,
    /// Upper bound (inclusive).
    pub max: i64,
    /// Starting value.
    pub initial: i64,
}

impl StatDef {
    /// Clamps `value` into the stat bounds.
    #[must_use]
    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }
}

/// An executable action: a visible choice or a fallback executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDef {
    /// Action id, unique within its namespace.
    pub id: String,
    /// Player-facing label.
    #[serde(default)]
    pub label: String,
    /// Node to move to; `None` stays on the current node.
    #[serde(default)]
    pub next_node: Option<String>,
    /// Prerequisites; all must hold.
    #[serde(default)]
    pub requires: Vec<Condition>,
    /// Effects applied when the action executes.
    #[serde(default)]
    pub effects: EffectSpec,
    /// Executor to reroute to when a visible choice is blocked.
    #[serde(default)]
    pub fallback: Option<String>,
}

/// A mapping-only intent: never shown, only targeted by the intent mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentDef {
    /// Intent id, unique within the node.
    pub id: String,
    /// Hint for the intent mapper.
    #[serde(default)]
    pub description: String,
    /// Visible choice of the node or fallback executor this intent aliases.
    pub maps_to: String,
    /// Extension operations merged after the target's own operations.
    #[serde(default)]
    pub extra_ops: Vec<EffectOp>,
}

/// A story graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node id.
    pub id: String,
    /// Title used in narration prompts.
    #[serde(default)]
    pub title: String,
    /// Scene description used in narration prompts.
    #[serde(default)]
    pub description: String,
    /// Visible choices.
    #[serde(default)]
    pub choices: Vec<ActionDef>,
    /// Mapping-only intents.
    #[serde(default)]
    pub intents: Vec<IntentDef>,
    /// Node-specific fallback executor.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl Node {
    /// Looks up a visible choice.
    #[must_use]
    pub fn choice(&self, choice_id: &str) -> Option<&ActionDef> {
        self.choices.iter().find(|c| c.id == choice_id)
    }

    /// Looks up an intent.
    #[must_use]
    pub fn intent(&self, intent_id: &str) -> Option<&IntentDef> {
        self.intents.iter().find(|i| i.id == intent_id)
    }
}

/// Why a step is routed to a fallback executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The request carried no input.
    NoInput,
    /// The input policy gate rejected the free text.
    InputRejected,
    /// Mapping confidence was between the low and high thresholds.
    LowConfidence,
    /// Mapping confidence was below the low threshold.
    NoMatch,
    /// The mapper flagged the input.
    PolicyFlagged,
    /// The selected visible target was blocked.
    Blocked,
}

/// Pack-level fallback executor assignment per reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Executor used when nothing more specific applies.
    pub default: String,
    /// Executor for low-confidence mappings.
    #[serde(default)]
    pub low_confidence: Option<String>,
    /// Executor for unmatched input.
    #[serde(default)]
    pub no_match: Option<String>,
    /// Executor for rejected input.
    #[serde(default)]
    pub input_rejected: Option<String>,
    /// Executor for empty requests.
    #[serde(default)]
    pub no_input: Option<String>,
    /// Executor for flagged input.
    #[serde(default)]
    pub policy_flagged: Option<String>,
}

impl FallbackPolicy {
    fn for_reason(&self, reason: FallbackReason) -> Option<&str> {
        match reason {
            FallbackReason::NoInput => self.no_input.as_deref(),
            FallbackReason::InputRejected => self.input_rejected.as_deref(),
            FallbackReason::LowConfidence => self.low_confidence.as_deref(),
            FallbackReason::NoMatch => self.no_match.as_deref(),
            FallbackReason::PolicyFlagged => self.policy_flagged.as_deref(),
            FallbackReason::Blocked => None,
        }
    }
}

/// A quest milestone trigger, evaluated against the step's event facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MilestoneTrigger {
    /// The step moved into `node`.
    EnterNode { node: String },
    /// The step moved out of `node`.
    LeaveNode { node: String },
    /// The step executed the choice or executor `target`.
    ExecuteTarget { target: String },
    /// The step changed `stat` by at least `at_least` (signed).
    StatDelta { stat: String, at_least: i64 },
    /// The post-step state satisfies `condition`.
    State { condition: Condition },
}

/// A single milestone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneDef {
    /// Milestone id, unique within its stage.
    pub id: String,
    /// Completion trigger.
    pub trigger: MilestoneTrigger,
}

/// An ordered quest stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    /// Stage id.
    pub id: String,
    /// Milestones; all must complete.
    pub milestones: Vec<MilestoneDef>,
    /// Reward applied when the stage completes.
    #[serde(default)]
    pub reward: EffectSpec,
}

/// A quest of ordered stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestDef {
    /// Quest id.
    pub id: String,
    /// Title.
    #[serde(default)]
    pub title: String,
    /// Activate at session start.
    #[serde(default)]
    pub auto_start: bool,
    /// Ordered stages.
    pub stages: Vec<StageDef>,
    /// Reward applied once when the last stage completes.
    #[serde(default)]
    pub completion_reward: EffectSpec,
}

/// A weighted, cooldown-gated random event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDef {
    /// Event id.
    pub id: String,
    /// Draw weight; must be positive.
    pub weight: u32,
    /// Conditions on the pre-transition state.
    #[serde(default)]
    pub pre: Vec<Condition>,
    /// Conditions on the post-transition state.
    #[serde(default)]
    pub post: Vec<Condition>,
    /// Steps before the event is eligible again.
    #[serde(default)]
    pub cooldown_steps: u32,
    /// Fires at most once per session.
    #[serde(default)]
    pub once_per_run: bool,
    /// Effects applied when the event fires.
    #[serde(default)]
    pub effects: EffectSpec,
    /// Hint passed to narration.
    #[serde(default)]
    pub text: String,
}

/// Outcome class of an ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndingOutcome {
    /// A good ending.
    Success,
    /// A bad ending.
    Failure,
    /// Neither.
    Neutral,
}

impl EndingOutcome {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Neutral => "neutral",
        }
    }
}

/// A configured ending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndingDef {
    /// Ending id.
    pub id: String,
    /// Evaluation priority; lower is evaluated first.
    #[serde(default)]
    pub priority: i32,
    /// Title.
    #[serde(default)]
    pub title: String,
    /// Outcome class.
    pub outcome: EndingOutcome,
    /// Conditions on the post-transition state; all must hold.
    #[serde(default)]
    pub trigger: Vec<Condition>,
}

/// Forces an ending when a run exceeds its budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Maximum day count.
    #[serde(default)]
    pub max_days: Option<u32>,
    /// Maximum step count.
    #[serde(default)]
    pub max_steps: Option<i64>,
    /// Ending forced when a limit is reached.
    pub ending_id: String,
}

/// Initial instance item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSeed {
    /// Instance id.
    pub instance_id: String,
    /// Item id.
    pub item: String,
}

/// Initial NPC state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcSeed {
    /// Starting relation.
    #[serde(default)]
    pub relation: i64,
    /// Starting mood.
    #[serde(default)]
    pub mood: Option<String>,
    /// Starting goals.
    #[serde(default)]
    pub goals: Vec<String>,
}

/// Initial values for non-stat state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialState {
    /// Stack items.
    #[serde(default)]
    pub items: BTreeMap<String, u32>,
    /// Instance items.
    #[serde(default)]
    pub instances: Vec<InstanceSeed>,
    /// Currency.
    #[serde(default)]
    pub currency: i64,
    /// Inventory capacity in stack units plus instances.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// World flags.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    /// Faction reputation.
    #[serde(default)]
    pub reputation: BTreeMap<String, i64>,
    /// NPCs.
    #[serde(default)]
    pub npcs: BTreeMap<String, NpcSeed>,
}

impl Default for InitialState {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            instances: Vec::new(),
            currency: 0,
            capacity: default_capacity(),
            flags: BTreeMap::new(),
            reputation: BTreeMap::new(),
            npcs: BTreeMap::new(),
        }
    }
}

/// The immutable story graph a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryPack {
    /// Story id.
    pub story_id: String,
    /// Published version.
    pub version: i64,
    /// Title.
    #[serde(default)]
    pub title: String,
    /// Node a session starts at.
    pub start_node: String,
    /// Steps per in-game day; 0 disables the day clock.
    #[serde(default)]
    pub steps_per_day: u32,
    /// Declared stats.
    #[serde(default)]
    pub stats: Vec<StatDef>,
    /// Initial non-stat state.
    #[serde(default)]
    pub initial: InitialState,
    /// Graph nodes.
    pub nodes: Vec<Node>,
    /// Pack-level fallback executors.
    pub fallback_executors: Vec<ActionDef>,
    /// Fallback executor assignment.
    pub fallback_policy: FallbackPolicy,
    /// Quests.
    #[serde(default)]
    pub quests: Vec<QuestDef>,
    /// Random events.
    #[serde(default)]
    pub events: Vec<EventDef>,
    /// Endings.
    #[serde(default)]
    pub endings: Vec<EndingDef>,
    /// Optional timeout ending policy.
    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
}

impl StoryPack {
    /// Parses a pack from YAML without validating it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the document does not parse.
    pub fn from_yaml(source: &str) -> Result<Self, DomainError> {
        serde_yaml::from_str(source)
            .map_err(|e| DomainError::Validation(format!("story pack does not parse: {e}")))
    }

    /// Hex SHA-256 of the canonical JSON form of the pack.
    #[must_use]
    pub fn content_hash(&self) -> String {
        // Serialization of derived Serialize types to bytes is infallible.
        let bytes = serde_json::to_vec(self).expect("StoryPack serialization is infallible");
        Sha256::digest(&bytes)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Looks up a fallback executor.
    #[must_use]
    pub fn executor(&self, executor_id: &str) -> Option<&ActionDef> {
        self.fallback_executors.iter().find(|e| e.id == executor_id)
    }

    /// Looks up a stat definition.
    #[must_use]
    pub fn stat(&self, stat_id: &str) -> Option<&StatDef> {
        self.stats.iter().find(|s| s.id == stat_id)
    }

    /// Looks up a quest.
    #[must_use]
    pub fn quest(&self, quest_id: &str) -> Option<&QuestDef> {
        self.quests.iter().find(|q| q.id == quest_id)
    }

    /// Looks up an ending.
    #[must_use]
    pub fn ending(&self, ending_id: &str) -> Option<&EndingDef> {
        self.endings.iter().find(|e| e.id == ending_id)
    }

    /// Fallback executor id for a step at `node` downgraded for `reason`.
    ///
    /// Resolution order: the node's own fallback, then the policy executor
    /// for the reason, then the policy default.
    #[must_use]
    pub fn fallback_for<'a>(&'a self, node: &'a Node, reason: FallbackReason) -> &'a str {
        node.fallback
            .as_deref()
            .or_else(|| self.fallback_policy.for_reason(reason))
            .unwrap_or(&self.fallback_policy.default)
    }

    /// Reroute target for a blocked visible choice.
    #[must_use]
    pub fn reroute_for<'a>(&'a self, node: &'a Node, choice: &'a ActionDef) -> &'a str {
        choice
            .fallback
            .as_deref()
            .unwrap_or_else(|| self.fallback_for(node, FallbackReason::Blocked))
    }

    /// Endings in evaluation order: priority ascending, then id ascending.
    #[must_use]
    pub fn endings_in_order(&self) -> Vec<&EndingDef> {
        let mut endings: Vec<&EndingDef> = self.endings.iter().collect();
        endings.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        endings
    }

    /// Every id the narration must never leak: nodes, choices, intents,
    /// executors, quests, stages, milestones, events and endings.
    #[must_use]
    pub fn internal_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for node in &self.nodes {
            ids.push(node.id.clone());
            ids.extend(node.choices.iter().map(|c| c.id.clone()));
            ids.extend(node.intents.iter().map(|i| i.id.clone()));
        }
        ids.extend(self.fallback_executors.iter().map(|e| e.id.clone()));
        for quest in &self.quests {
            ids.push(quest.id.clone());
            for stage in &quest.stages {
                ids.push(stage.id.clone());
                ids.extend(stage.milestones.iter().map(|m| m.id.clone()));
            }
        }
        ids.extend(self.events.iter().map(|e| e.id.clone()));
        ids.extend(self.endings.iter().map(|e| e.id.clone()));
        ids.sort();
        ids.dedup();
        ids
    }
}
