//! Fablestep HTTP API.
//!
//! Exposes session start and read models, step submission as JSON and as a
//! server-sent event stream, and a health check.

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

/// Builds the application router.
pub fn app(state: state::AppState) -> Router {
    // TODO: Replace CorsLayer::permissive() with configured origins once a web client ships.
    Router::new()
        .merge(routes::health::router())
        .nest(
            "/api/v1/sessions",
            routes::session::router().merge(routes::step::router()),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
