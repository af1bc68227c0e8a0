//! Aggregate root for the Session & Step Commit context.

use chrono::{DateTime, Utc};
use fablestep_core::error::DomainError;
use fablestep_core::repository::{SessionRecord, SessionStatus};
use fablestep_rules::domain::state::SessionState;
use fablestep_story::domain::pack::StoryPack;
use uuid::Uuid;

/// A session loaded for one step: a snapshot of its row with typed state.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Session identifier.
    pub id: Uuid,
    /// Story the session is bound to.
    pub story_id: String,
    /// Published story version.
    pub story_version: i64,
    /// Number of committed steps.
    pub version: i64,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Typed session state.
    pub state: SessionState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Creates a fresh session at the pack's start node.
    #[must_use]
    pub fn start(id: Uuid, pack: &StoryPack, now: DateTime<Utc>) -> Self {
        Self {
            id,
            story_id: pack.story_id.clone(),
            story_version: pack.version,
            version: 0,
            status: SessionStatus::Active,
            state: SessionState::initial(pack),
            created_at: now,
        }
    }

    /// Rebuilds a session from its stored row.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the stored state does not
    /// deserialize.
    pub fn from_record(record: &SessionRecord) -> Result<Self, DomainError> {
        Ok(Self {
            id: record.id,
            story_id: record.story_id.clone(),
            story_version: record.story_version,
            version: record.version,
            status: record.status,
            state: SessionState::from_value(&record.state)?,
            created_at: record.created_at,
        })
    }

    /// Stored row for this snapshot.
    #[must_use]
    pub fn to_record(&self, updated_at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: self.id,
            story_id: self.story_id.clone(),
            story_version: self.story_version,
            state: self.state.to_value(),
            version: self.version,
            status: self.status,
            created_at: self.created_at,
            updated_at,
        }
    }

    /// Fails unless the session accepts steps.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::SessionNotActive` for an ended session.
    pub fn ensure_active(&self) -> Result<(), DomainError> {
        if self.status == SessionStatus::Active && !self.state.is_ended() {
            Ok(())
        } else {
            Err(DomainError::SessionNotActive(self.id))
        }
    }

    /// Index the next committed step will carry.
    #[must_use]
    pub fn next_step_index(&self) -> i64 {
        self.version + 1
    }
}

/// Status a session has after reaching `state`.
#[must_use]
pub fn status_for(state: &SessionState) -> SessionStatus {
    if state.is_ended() {
        SessionStatus::Ended
    } else {
        SessionStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use fablestep_test_support::fixtures;

    use super::*;

    #[test]
    fn test_start_builds_initial_snapshot() {
        // Arrange
        let pack = fixtures::lantern_keep();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();

        // Act
        let session = Session::start(Uuid::new_v4(), &pack, now);

        // Assert
        assert_eq!(session.version, 0);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.state.node_id, "gate");
        assert_eq!(session.next_step_index(), 1);
        assert!(session.ensure_active().is_ok());
    }

    #[test]
    fn test_record_round_trip_preserves_snapshot() {
        let pack = fixtures::lantern_keep();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let session = Session::start(Uuid::new_v4(), &pack, now);

        let restored = Session::from_record(&session.to_record(now)).unwrap();

        assert_eq!(restored, session);
    }

    #[test]
    fn test_ended_session_rejects_steps() {
        let pack = fixtures::lantern_keep();
        let mut session = Session::start(Uuid::new_v4(), &pack, Utc::now());
        session.state.run_state.ending_id = Some("dawn".into());

        assert_eq!(status_for(&session.state), SessionStatus::Ended);
        assert_eq!(
            session.ensure_active(),
            Err(DomainError::SessionNotActive(session.id))
        );
    }
}
