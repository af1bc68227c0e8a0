//! Health check.
//!
//! Reports the build version and whether session storage answers. A lookup of
//! the nil session id exercises the repository without touching real rows.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::get};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when storage fails.
    pub status: &'static str,
    /// Service version.
    pub version: &'static str,
    /// `ok` or `unavailable`.
    pub storage: &'static str,
}

/// GET /health
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let storage_ok = match state.runtime.repo.load_session(Uuid::nil()).await {
        Ok(_) => true,
        Err(err) => {
            warn!(error = %err, "health check: session storage unavailable");
            false
        }
    };
    let (status, label, storage) = if storage_ok {
        (StatusCode::OK, "ok", "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unavailable")
    };
    (
        status,
        Json(HealthResponse {
            status: label,
            version: env!("CARGO_PKG_VERSION"),
            storage,
        }),
    )
}

/// Returns the health check router.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
