//! Typed session state.
//!
//! Each sub-state is its own structure so the engines' invariants are carried
//! by types rather than by an untyped map. The assembled `SessionState` is
//! what the session row stores, serialized as JSON.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use fablestep_core::error::DomainError;
use fablestep_story::domain::pack::StoryPack;
use serde::{Deserialize, Serialize};

/// Lower bound of an NPC relation.
pub const NPC_RELATION_MIN: i64 = -100;
/// Upper bound of an NPC relation.
pub const NPC_RELATION_MAX: i64 = 100;

/// Stack items, instance items, equipment, currency and capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryState {
    /// Stack item counts by item id.
    pub stacks: BTreeMap<String, u32>,
    /// Instance items: instance id to item id.
    pub instances: BTreeMap<String, String>,
    /// Equipment: slot to instance id.
    pub equipment: BTreeMap<String, String>,
    /// Currency balance; never negative.
    pub currency: i64,
    /// Maximum units held (stack units plus instances).
    pub capacity: u32,
}

impl InventoryState {
    /// Units currently held.
    #[must_use]
    pub fn load(&self) -> u64 {
        let stacked: u64 = self.stacks.values().map(|q| u64::from(*q)).sum();
        stacked + self.instances.len() as u64
    }

    /// Whether at least `quantity` of `item` is held as stacks or instances.
    #[must_use]
    pub fn has_item(&self, item: &str, quantity: u32) -> bool {
        let stacked = self.stacks.get(item).copied().unwrap_or(0);
        let instanced = self.instances.values().filter(|i| *i == item).count();
        u64::from(stacked) + instanced as u64 >= u64::from(quantity)
    }
}

/// A timed status effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedEffect {
    /// Status id.
    pub status: String,
    /// Steps left before expiry.
    pub remaining_steps: u32,
}

/// Timed effects, world flags and faction reputation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalStatus {
    /// Active timed effects.
    pub effects: Vec<TimedEffect>,
    /// World flags.
    pub world_flags: BTreeMap<String, bool>,
    /// Faction reputation.
    pub reputation: BTreeMap<String, i64>,
}

impl ExternalStatus {
    /// Whether a timed status is active.
    #[must_use]
    pub fn has_status(&self, status: &str) -> bool {
        self.effects.iter().any(|e| e.status == status)
    }

    /// Whether a world flag is set.
    #[must_use]
    pub fn flag(&self, flag: &str) -> bool {
        self.world_flags.get(flag).copied().unwrap_or(false)
    }
}

/// Reference to NPC memories moved out of hot memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdMemoryRef {
    /// Stable reference id.
    pub ref_id: String,
    /// Number of entries archived under this reference.
    pub entries: usize,
    /// Short summary of the archived entries.
    pub summary: String,
    /// Step at which the entries were archived.
    pub archived_at_step: i64,
}

/// Per-NPC state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcRecord {
    /// Relation in `[NPC_RELATION_MIN, NPC_RELATION_MAX]`.
    pub relation: i64,
    /// Current mood.
    pub mood: Option<String>,
    /// Beliefs by key.
    pub beliefs: BTreeMap<String, String>,
    /// Goals and whether they are done.
    pub goals: BTreeMap<String, bool>,
    /// Recent memories, bounded by policy.
    pub hot_memory: Vec<String>,
    /// References to archived memories.
    pub cold_memory: Vec<ColdMemoryRef>,
}

/// All NPCs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NpcState {
    /// NPC records by id.
    pub npcs: BTreeMap<String, NpcRecord>,
}

/// Quest progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestState {
    /// Active quest ids.
    pub active: BTreeSet<String>,
    /// Completed quest ids.
    pub completed: BTreeSet<String>,
    /// Active stage index per active quest.
    pub stages: BTreeMap<String, usize>,
    /// Completed milestone ids of the active stage, per quest.
    pub milestones: BTreeMap<String, BTreeSet<String>>,
    /// Ring buffer of recent quest and event notes.
    pub recent_events: VecDeque<String>,
}

impl QuestState {
    /// Appends a note to the ring buffer, dropping the oldest beyond `cap`.
    pub fn record(&mut self, note: String, cap: usize) {
        self.recent_events.push_back(note);
        while self.recent_events.len() > cap {
            self.recent_events.pop_front();
        }
    }

    /// Activates `quest` at stage 0 unless it is active or completed.
    /// Returns whether it was activated.
    pub fn activate(&mut self, quest: &str) -> bool {
        if self.active.contains(quest) || self.completed.contains(quest) {
            return false;
        }
        self.active.insert(quest.to_owned());
        self.stages.insert(quest.to_owned(), 0);
        self.milestones.insert(quest.to_owned(), BTreeSet::new());
        true
    }
}

/// Run lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Number of committed steps.
    pub step_index: i64,
    /// In-game day; 0 when the pack has no day clock.
    pub day: u32,
    /// Events that have fired this run.
    pub triggered_events: BTreeSet<String>,
    /// Remaining cooldown steps per event.
    pub cooldowns: BTreeMap<String, u32>,
    /// Ending reached, if any.
    pub ending_id: Option<String>,
    /// Outcome of the ending reached.
    pub ending_outcome: Option<String>,
    /// Steps that executed a fallback or degraded to a no-op.
    pub fallback_count: u32,
}

/// The full state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Current node.
    pub node_id: String,
    /// Scalar stats.
    pub stats: BTreeMap<String, i64>,
    /// Inventory.
    pub inventory: InventoryState,
    /// External status.
    pub external_status: ExternalStatus,
    /// NPC state.
    pub npc_state: NpcState,
    /// Quest state.
    pub quest_state: QuestState,
    /// Run state.
    pub run_state: RunState,
}

impl SessionState {
    /// Builds the starting state of a session bound to `pack`.
    #[must_use]
    pub fn initial(pack: &StoryPack) -> Self {
        let initial = &pack.initial;
        let mut quest_state = QuestState::default();
        for quest in pack.quests.iter().filter(|q| q.auto_start) {
            quest_state.activate(&quest.id);
        }
        Self {
            node_id: pack.start_node.clone(),
            stats: pack
                .stats
                .iter()
                .map(|s| (s.id.clone(), s.initial))
                .collect(),
            inventory: InventoryState {
                stacks: initial
                    .items
                    .iter()
                    .filter(|(_, q)| **q > 0)
                    .map(|(k, q)| (k.clone(), *q))
                    .collect(),
                instances: initial
                    .instances
                    .iter()
                    .map(|i| (i.instance_id.clone(), i.item.clone()))
                    .collect(),
                equipment: BTreeMap::new(),
                currency: initial.currency.max(0),
                capacity: initial.capacity,
            },
            external_status: ExternalStatus {
                effects: Vec::new(),
                world_flags: initial.flags.clone(),
                reputation: initial.reputation.clone(),
            },
            npc_state: NpcState {
                npcs: initial
                    .npcs
                    .iter()
                    .map(|(id, seed)| {
                        (
                            id.clone(),
                            NpcRecord {
                                relation: seed.relation.clamp(NPC_RELATION_MIN, NPC_RELATION_MAX),
                                mood: seed.mood.clone(),
                                goals: seed.goals.iter().map(|g| (g.clone(), false)).collect(),
                                ..NpcRecord::default()
                            },
                        )
                    })
                    .collect(),
            },
            quest_state,
            run_state: RunState {
                day: day_for(pack, 0),
                ..RunState::default()
            },
        }
    }

    /// Deserializes a stored state.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the stored JSON does not match.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, DomainError> {
        serde_json::from_value(value.clone())
            .map_err(|e| DomainError::Infrastructure(format!("state deserialization failed: {e}")))
    }

    /// Serializes the state for storage.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        serde_json::to_value(self).expect("SessionState serialization is infallible")
    }

    /// Stat value, if the stat is tracked.
    #[must_use]
    pub fn stat(&self, stat: &str) -> Option<i64> {
        self.stats.get(stat).copied()
    }

    /// Whether an ending has been reached.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.run_state.ending_id.is_some()
    }
}

/// Day for a step index under the pack's day clock.
#[must_use]
pub fn day_for(pack: &StoryPack, step_index: i64) -> u32 {
    if pack.steps_per_day == 0 {
        return 0;
    }
    let days = step_index.max(0) / i64::from(pack.steps_per_day);
    u32::try_from(days).unwrap_or(u32::MAX - 1) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use fablestep_test_support::fixtures;

    #[test]
    fn test_initial_state_from_pack() {
        // Arrange
        let pack = fixtures::lantern_keep();

        // Act
        let state = SessionState::initial(&pack);

        // Assert
        assert_eq!(state.node_id, pack.start_node);
        assert_eq!(state.stat("resolve"), Some(5));
        assert!(state.inventory.has_item("lantern", 1));
        assert_eq!(state.inventory.currency, 3);
        assert!(state.quest_state.active.contains("light_the_beacon"));
        assert_eq!(state.quest_state.stages["light_the_beacon"], 0);
        assert_eq!(state.run_state.step_index, 0);
        assert_eq!(state.run_state.day, 1);
        assert_eq!(state.npc_state.npcs["keeper"].relation, 0);
    }

    #[test]
    fn test_state_round_trips_through_storage_value() {
        let pack = fixtures::lantern_keep();
        let state = SessionState::initial(&pack);
        let restored = SessionState::from_value(&state.to_value()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let mut quests = QuestState::default();
        for i in 0..25 {
            quests.record(format!("note:{i}"), 20);
        }
        assert_eq!(quests.recent_events.len(), 20);
        assert_eq!(quests.recent_events.front().unwrap(), "note:5");
    }

    #[test]
    fn test_has_item_counts_instances() {
        let mut inventory = InventoryState::default();
        inventory.instances.insert("sword#1".into(), "sword".into());
        inventory.stacks.insert("sword".into(), 1);
        assert!(inventory.has_item("sword", 2));
        assert!(!inventory.has_item("sword", 3));
        assert_eq!(inventory.load(), 2);
    }

    #[test]
    fn test_day_clock() {
        let mut pack = fixtures::lantern_keep();
        pack.steps_per_day = 4;
        assert_eq!(day_for(&pack, 0), 1);
        assert_eq!(day_for(&pack, 3), 1);
        assert_eq!(day_for(&pack, 4), 2);
        pack.steps_per_day = 0;
        assert_eq!(day_for(&pack, 10), 0);
    }
}
