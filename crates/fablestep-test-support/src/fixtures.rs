//! Story pack fixtures.

use fablestep_story::domain::pack::StoryPack;

/// A small three-node pack exercising every engine.
///
/// `gate` offers `knock` (open), `climb` (blocked below resolve 7, reroutes
/// to `stumble`, which is itself blocked below resolve 9) and `bribe`
/// (blocked below 10 currency, falls back through the policy). The
/// auto-started quest completes when the beacon is lit, which also triggers
/// the `dawn` ending.
pub const LANTERN_KEEP_YAML: &str = r"
story_id: lantern-keep
version: 1
title: The Lantern Keep
start_node: gate
steps_per_day: 4
stats:
  - { id: resolve, min: 0, max: 10, initial: 5 }
  - { id: suspicion, min: 0, max: 10, initial: 2 }
initial:
  items: { lantern: 1 }
  currency: 3
  npcs:
    keeper: { relation: 0, mood: wary, goals: [guard_light] }
nodes:
  - id: gate
    title: The Outer Gate
    description: Rain hammers the iron gate of the keep.
    choices:
      - id: knock
        label: Knock on the gate
        next_node: hall
        effects:
          stats:
            - { stat: resolve, center: 1, intensity: 1 }
          ops:
            - { op: npc_remember, npc: keeper, memory: a traveller knocked politely }
      - id: climb
        label: Climb the wall
        next_node: hall
        fallback: stumble
        requires:
          - { kind: stat_at_least, stat: resolve, value: 7 }
        effects:
          stats:
            - { stat: suspicion, center: 2 }
      - id: bribe
        label: Slip coins through the grate
        next_node: hall
        requires:
          - { kind: currency_at_least, amount: 10 }
        effects:
          ops:
            - { op: adjust_currency, amount: -10 }
    intents:
      - id: plead
        description: Beg the keeper for shelter
        maps_to: knock
        extra_ops:
          - { op: adjust_npc, npc: keeper, relation: 5, mood: softened }
  - id: hall
    title: The Great Hall
    description: A cold hearth and a spiral stair.
    choices:
      - id: light
        label: Carry the lantern up the stair
        next_node: beacon
        requires:
          - { kind: has_item, item: lantern }
        effects:
          stats:
            - { stat: resolve, center: 1 }
          ops:
            - { op: set_flag, flag: beacon_lit }
      - id: rest
        label: Rest by the hearth
        effects:
          ops:
            - { op: apply_status, status: rested, duration: 2 }
  - id: beacon
    title: The Beacon
    description: The great lamp waits, cold and dark.
    choices:
      - id: wait
        label: Wait for dawn
fallback_executors:
  - id: hesitate
    label: Hesitate
    effects:
      stats:
        - { stat: suspicion, center: 1, intensity: 1 }
  - id: ponder
    label: Ponder
    effects:
      stats:
        - { stat: resolve, intensity: 1 }
  - id: stumble
    label: Stumble
    requires:
      - { kind: stat_at_least, stat: resolve, value: 9 }
fallback_policy:
  default: hesitate
  low_confidence: ponder
quests:
  - id: light_the_beacon
    title: Light the Beacon
    auto_start: true
    stages:
      - id: enter_keep
        milestones:
          - id: reach_hall
            trigger: { kind: enter_node, node: hall }
        reward:
          ops:
            - { op: adjust_currency, amount: 2 }
      - id: kindle
        milestones:
          - id: flame
            trigger:
              kind: state
              condition: { kind: flag_set, flag: beacon_lit }
    completion_reward:
      ops:
        - { op: adjust_currency, amount: 5 }
        - { op: adjust_reputation, faction: keepers, delta: 1 }
events:
  - id: gust
    weight: 3
    pre:
      - { kind: at_node, node: hall }
    cooldown_steps: 2
    effects:
      stats:
        - { stat: suspicion, center: 1 }
    text: A gust rattles the shutters.
  - id: echo
    weight: 1
    once_per_run: true
    pre:
      - { kind: at_node, node: hall }
    text: Footsteps echo somewhere above.
endings:
  - id: dawn
    priority: 0
    title: Dawn Over the Keep
    outcome: success
    trigger:
      - { kind: flag_set, flag: beacon_lit }
  - id: caught
    priority: 1
    title: Caught
    outcome: failure
    trigger:
      - { kind: stat_at_least, stat: suspicion, value: 8 }
  - id: lost_in_dark
    priority: 5
    title: Lost in the Dark
    outcome: neutral
    trigger:
      - { kind: step_at_least, step: 1000 }
timeout:
  max_steps: 12
  ending_id: lost_in_dark
";

/// Parses and validates [`LANTERN_KEEP_YAML`].
///
/// # Panics
///
/// Panics if the fixture does not parse or validate.
#[must_use]
pub fn lantern_keep() -> StoryPack {
    let pack = StoryPack::from_yaml(LANTERN_KEEP_YAML).expect("fixture parses");
    pack.validate().expect("fixture validates");
    pack
}
