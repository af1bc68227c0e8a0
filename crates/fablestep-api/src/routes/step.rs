//! Step submission routes: one JSON response, or a server-sent event stream.
//!
//! Both require an `Idempotency-Key` header. Replayed JSON responses carry
//! `Idempotent-Replayed: true`; replayed streams carry a `replay` event.
//! Contract errors found before the stream starts are plain JSON errors.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use fablestep_core::error::DomainError;
use fablestep_core::step::{StepPayload, StepStreamEvent};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use fablestep_session::application::{command_handlers, streaming};
use fablestep_session::domain::commands::SubmitStep;

use crate::error::ApiError;
use crate::state::AppState;

/// Request header carrying the idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
/// Response header set on replayed results.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";
/// Longest accepted idempotency key; matches the storage column.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

fn step_command(
    session_id: Uuid,
    headers: &HeaderMap,
    body: Result<Json<StepPayload>, JsonRejection>,
) -> Result<SubmitStep, ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if idempotency_key.is_empty() {
        return Err(DomainError::MissingIdempotencyKey.into());
    }
    if idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(DomainError::Validation(format!(
            "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} characters"
        ))
        .into());
    }
    let Json(payload) = body.map_err(|rej| DomainError::Validation(rej.body_text()))?;
    payload.input()?;
    Ok(SubmitStep {
        correlation_id: Uuid::new_v4(),
        session_id,
        idempotency_key: idempotency_key.to_owned(),
        payload,
    })
}

/// POST /{id}/steps
#[instrument(skip_all, fields(session_id = %session_id))]
async fn submit_step(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    body: Result<Json<StepPayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let command = step_command(session_id, &headers, body)?;

    info!(
        correlation_id = %command.correlation_id,
        idempotency_key = %command.idempotency_key,
        "handling submit_step command"
    );

    let outcome = command_handlers::handle_submit_step(&command, &state.runtime).await?;

    let mut response = Json(outcome.body).into_response();
    if outcome.replayed {
        response
            .headers_mut()
            .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    }
    Ok(response)
}

/// SSE frame for a step event: the event name is its kind, the data its
/// payload (`null` for `done`).
fn sse_event(event: &StepStreamEvent) -> Result<Event, axum::Error> {
    let mut envelope = serde_json::to_value(event).map_err(axum::Error::new)?;
    let data = envelope.get_mut("data").map_or(Value::Null, Value::take);
    Event::default().event(event.kind()).json_data(data)
}

/// POST /{id}/steps/stream
#[instrument(skip_all, fields(session_id = %session_id))]
async fn stream_step(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    body: Result<Json<StepPayload>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let command = step_command(session_id, &headers, body)?;

    info!(
        correlation_id = %command.correlation_id,
        idempotency_key = %command.idempotency_key,
        "handling streamed submit_step command"
    );

    // Dropping the response body (client disconnect) drops the receiver,
    // which the pipeline observes as cancellation.
    let events = streaming::spawn_step_stream(state.runtime.clone(), command)
        .into_stream()
        .map(|event| sse_event(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Returns the router for step submission.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/steps", post(submit_step))
        .route("/{id}/steps/stream", post(stream_step))
}
