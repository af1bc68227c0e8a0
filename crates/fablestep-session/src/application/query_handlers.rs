//! Query handlers for the Session & Step Commit context.
//!
//! Read-only views over session rows and the action log.

use fablestep_core::error::DomainError;
use fablestep_core::repository::{ActionLogEntry, SessionRecord, SessionRepository, SessionStatus};
use serde::Serialize;
use uuid::Uuid;

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    /// The session identifier.
    pub session_id: Uuid,
    /// Story the session plays.
    pub story_id: String,
    /// Published story version.
    pub story_version: i64,
    /// Number of committed steps.
    pub version: i64,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Current node.
    pub node_id: String,
    /// Full session state.
    pub state: serde_json::Value,
}

impl SessionView {
    /// Builds the view of a stored row.
    #[must_use]
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            session_id: record.id,
            story_id: record.story_id.clone(),
            story_version: record.story_version,
            version: record.version,
            status: record.status,
            node_id: record
                .state
                .get("node_id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            state: record.state.clone(),
        }
    }
}

/// Retrieves a session by id.
///
/// # Errors
///
/// Returns `DomainError::SessionNotFound` if no session exists for the ID.
pub async fn get_session_by_id(
    session_id: Uuid,
    repo: &dyn SessionRepository,
) -> Result<SessionView, DomainError> {
    repo.load_session(session_id)
        .await?
        .map(|record| SessionView::from_record(&record))
        .ok_or(DomainError::SessionNotFound(session_id))
}

/// Retrieves the action log of a session, ordered by step index.
///
/// # Errors
///
/// Returns `DomainError::SessionNotFound` if no session exists for the ID.
pub async fn get_action_log(
    session_id: Uuid,
    repo: &dyn SessionRepository,
) -> Result<Vec<ActionLogEntry>, DomainError> {
    if repo.load_session(session_id).await?.is_none() {
        return Err(DomainError::SessionNotFound(session_id));
    }
    repo.load_action_log(session_id).await
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use fablestep_store::memory::InMemorySessionRepository;
    use fablestep_test_support::{FailingSessionRepository, fixtures};

    use super::*;
    use crate::domain::aggregates::Session;

    #[tokio::test]
    async fn test_get_session_by_id_returns_view() {
        // Arrange
        let repo = InMemorySessionRepository::new();
        let session = Session::start(Uuid::new_v4(), &fixtures::lantern_keep(), Utc::now());
        repo.insert_session(&session.to_record(Utc::now())).await.unwrap();

        // Act
        let view = get_session_by_id(session.id, &repo).await.unwrap();

        // Assert
        assert_eq!(view.session_id, session.id);
        assert_eq!(view.story_id, "lantern-keep");
        assert_eq!(view.node_id, "gate");
        assert_eq!(view.version, 0);
        assert_eq!(view.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_get_session_by_id_not_found() {
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();

        let result = get_session_by_id(id, &repo).await;

        assert_eq!(result, Err(DomainError::SessionNotFound(id)));
    }

    #[tokio::test]
    async fn test_get_action_log_requires_a_session() {
        let repo = InMemorySessionRepository::new();
        let id = Uuid::new_v4();

        assert_eq!(
            get_action_log(id, &repo).await,
            Err(DomainError::SessionNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_queries_surface_infrastructure_errors() {
        let result = get_session_by_id(Uuid::new_v4(), &FailingSessionRepository).await;

        assert!(matches!(result, Err(DomainError::Infrastructure(_))));
    }
}
