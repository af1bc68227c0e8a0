//! Declarative conditions used by prerequisites, triggers and endings.

use serde::{Deserialize, Serialize};

fn one() -> u32 {
    1
}

/// A predicate over session state.
///
/// Conditions are evaluated by the rules engines; this crate only defines
/// their authored shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Stat value is at least `value`.
    StatAtLeast { stat: String, value: i64 },
    /// Stat value is at most `value`.
    StatAtMost { stat: String, value: i64 },
    /// At least `quantity` of a stack item, or an instance of `item`.
    HasItem {
        item: String,
        #[serde(default = "one")]
        quantity: u32,
    },
    /// World flag is set to `true`.
    FlagSet { flag: String },
    /// World flag is absent or `false`.
    FlagUnset { flag: String },
    /// Currency is at least `amount`.
    CurrencyAtLeast { amount: i64 },
    /// Faction reputation is at least `value`.
    ReputationAtLeast { faction: String, value: i64 },
    /// NPC relation is at least `value`.
    NpcRelationAtLeast { npc: String, value: i64 },
    /// Quest is active.
    QuestActive { quest: String },
    /// Quest is completed.
    QuestCompleted { quest: String },
    /// Current node is `node`.
    AtNode { node: String },
    /// Step index is at least `step`.
    StepAtLeast { step: i64 },
    /// Day counter is at least `day`.
    DayAtLeast { day: u32 },
    /// Timed status effect is active.
    StatusActive { status: String },
    /// Any nested condition holds.
    Any { of: Vec<Condition> },
    /// The nested condition does not hold.
    Not { condition: Box<Condition> },
}

impl Condition {
    /// Stat ids referenced anywhere in this condition.
    #[must_use]
    pub fn referenced_stats(&self) -> Vec<&str> {
        match self {
            Self::StatAtLeast { stat, .. } | Self::StatAtMost { stat, .. } => vec![stat.as_str()],
            Self::Any { of } => of.iter().flat_map(Self::referenced_stats).collect(),
            Self::Not { condition } => condition.referenced_stats(),
            _ => Vec::new(),
        }
    }
}
