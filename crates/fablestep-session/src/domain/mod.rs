//! Domain layer for the Session & Step Commit context.

pub mod aggregates;
pub mod commands;
