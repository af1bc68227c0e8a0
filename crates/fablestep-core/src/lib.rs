//! Fablestep Core: shared domain abstractions.
//!
//! This crate defines the error taxonomy, policy configuration, wire types and
//! persistence contract that every bounded context depends on. It contains no
//! infrastructure code.

pub mod clock;
pub mod config;
pub mod error;
pub mod repository;
pub mod rng;
pub mod step;
