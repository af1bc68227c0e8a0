//! Fablestep: Session & Step Commit bounded context.
//!
//! Responsible for starting sessions, running the step pipeline under an
//! idempotency key, committing each step with an optimistic version check,
//! and streaming step progress to a cooperative consumer.

pub mod application;
pub mod domain;
