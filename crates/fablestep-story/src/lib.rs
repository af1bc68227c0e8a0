//! Fablestep: Story Pack bounded context.
//!
//! Responsible for the immutable published story graph a session is bound
//! to: nodes, choices, mapping-only intents, fallback executors, quests,
//! events and endings, together with pack validation and the catalog that
//! serves published packs.

pub mod catalog;
pub mod domain;
