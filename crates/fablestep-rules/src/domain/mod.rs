//! Deterministic step engines.

pub mod ending;
pub mod event;
pub mod prereq;
pub mod quest;
pub mod resolution;
pub mod router;
pub mod state;
pub mod transition;
