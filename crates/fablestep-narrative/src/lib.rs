//! Fablestep: Narrative Orchestration bounded context.
//!
//! Responsible for everything that touches free text or a language model:
//! the input policy gate, target selection with intent mapping, the narrator
//! contract, and scrubbing of generated prose.

pub mod domain;
