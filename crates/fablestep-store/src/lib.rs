//! Fablestep Store: `SessionRepository` implementations.
//!
//! `PgSessionRepository` is the production store; `InMemorySessionRepository`
//! backs local runs without a database and the session pipeline tests.

pub mod memory;
pub mod pg_session_repository;

use sqlx::migrate::Migrator;

/// Embedded schema migrations.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
