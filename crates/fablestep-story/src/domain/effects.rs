//! Authored effects: scalar stat deltas and structured operations.

use serde::{Deserialize, Serialize};

fn one() -> u32 {
    1
}

/// A scalar stat change scaled by the intensity tier.
///
/// The applied delta is `center + tier * intensity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatEffect {
    /// Stat id.
    pub stat: String,
    /// Delta at tier 0.
    #[serde(default)]
    pub center: i64,
    /// Additional delta per tier step.
    #[serde(default)]
    pub intensity: i64,
}

impl StatEffect {
    /// Delta for the given tier.
    #[must_use]
    pub fn delta_at(&self, tier: i8) -> i64 {
        self.center + i64::from(tier) * self.intensity
    }
}

/// A structured state operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EffectOp {
    /// Add stack items.
    AddItem {
        item: String,
        #[serde(default = "one")]
        quantity: u32,
    },
    /// Remove stack items; fails if fewer are held.
    RemoveItem {
        item: String,
        #[serde(default = "one")]
        quantity: u32,
    },
    /// Add a unique item instance.
    AddInstance { instance_id: String, item: String },
    /// Remove an item instance; unequips it first.
    RemoveInstance { instance_id: String },
    /// Equip an owned instance into a slot.
    Equip { slot: String, instance_id: String },
    /// Clear an equipment slot.
    Unequip { slot: String },
    /// Add or remove currency; fails on overdraft.
    AdjustCurrency { amount: i64 },
    /// Set a world flag.
    SetFlag {
        flag: String,
        #[serde(default = "yes")]
        value: bool,
    },
    /// Adjust faction reputation.
    AdjustReputation { faction: String, delta: i64 },
    /// Apply a timed status effect for `duration` steps.
    ApplyStatus { status: String, duration: u32 },
    /// Remove a timed status effect.
    ClearStatus { status: String },
    /// Adjust NPC relation and optionally set mood.
    AdjustNpc {
        npc: String,
        #[serde(default)]
        relation: i64,
        #[serde(default)]
        mood: Option<String>,
    },
    /// Append an entry to an NPC's hot memory.
    NpcRemember { npc: String, memory: String },
    /// Set an NPC belief.
    NpcBelieve {
        npc: String,
        key: String,
        value: String,
    },
    /// Add an NPC goal, or mark it done.
    NpcGoal {
        npc: String,
        goal: String,
        #[serde(default)]
        done: bool,
    },
    /// Activate a quest at its first stage.
    StartQuest { quest: String },
}

fn yes() -> bool {
    true
}

/// Effects of an action, stage reward or event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectSpec {
    /// Scalar stat changes.
    #[serde(default)]
    pub stats: Vec<StatEffect>,
    /// Structured operations, applied in order.
    #[serde(default)]
    pub ops: Vec<EffectOp>,
}

impl EffectSpec {
    /// Whether the spec changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty() && self.ops.is_empty()
    }
}
