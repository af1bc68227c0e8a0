//! Selection and narration.

pub mod gate;
pub mod mapper;
pub mod model;
pub mod narrator;
pub mod scrub;
pub mod selector;
