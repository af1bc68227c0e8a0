//! Shared test doubles, fixtures and utilities for Fablestep.

mod clock;
pub mod fixtures;
mod model;
mod repository;
mod rng;

pub use clock::FixedClock;
pub use model::{ScriptedMapper, ScriptedNarrator};
pub use repository::FailingSessionRepository;
pub use rng::{MockRng, SequenceRng};
