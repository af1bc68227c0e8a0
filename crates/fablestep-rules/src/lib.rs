//! Fablestep: Rules & Resolution bounded context.
//!
//! Responsible for the typed session state and the deterministic phases of a
//! step: prerequisite evaluation, fallback routing, state transition, and
//! quest, event and ending evaluation. Every engine is a pure function of its
//! inputs; none performs I/O.

pub mod domain;
