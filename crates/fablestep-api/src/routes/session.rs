//! Routes for starting and reading sessions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fablestep_core::repository::ActionLogEntry;
use serde::Deserialize;
use tracing::{info, instrument};
use uuid::Uuid;

use fablestep_session::application::command_handlers;
use fablestep_session::application::query_handlers::{self, SessionView};
use fablestep_session::domain::commands;

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /.
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    /// Story to play.
    pub story_id: String,
    /// Published version of the story.
    pub story_version: i64,
}

/// POST /
#[instrument(
    skip(state, request),
    fields(story_id = %request.story_id, story_version = request.story_version)
)]
async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let command = commands::StartSession {
        correlation_id: Uuid::new_v4(),
        story_id: request.story_id,
        story_version: request.story_version,
    };

    info!(correlation_id = %command.correlation_id, "handling start_session command");

    let runtime = &state.runtime;
    let view = command_handlers::handle_start_session(
        &command,
        runtime.catalog.as_ref(),
        runtime.clock.as_ref(),
        runtime.repo.as_ref(),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /{id}
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let view = query_handlers::get_session_by_id(session_id, state.runtime.repo.as_ref()).await?;
    Ok(Json(view))
}

/// GET /{id}/log
async fn get_action_log(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<ActionLogEntry>>, ApiError> {
    let log = query_handlers::get_action_log(session_id, state.runtime.repo.as_ref()).await?;
    Ok(Json(log))
}

/// Returns the router for session start and read models.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(start_session))
        .route("/{id}", get(get_session))
        .route("/{id}/log", get(get_action_log))
}
