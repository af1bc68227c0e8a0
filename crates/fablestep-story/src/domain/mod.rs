//! Story pack domain model.

pub mod condition;
pub mod effects;
pub mod pack;
pub mod validation;
