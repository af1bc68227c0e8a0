//! Application layer for the Session & Step Commit context.

pub mod command_handlers;
pub mod pipeline;
pub mod query_handlers;
pub mod runtime;
pub mod streaming;
