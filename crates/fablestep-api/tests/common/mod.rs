//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use fablestep_api::state::AppState;
use fablestep_core::config::StepPolicy;
use fablestep_core::repository::SessionRepository;
use fablestep_narrative::domain::mapper::{IntentMapper, MappedTargetType};
use fablestep_narrative::domain::narrator::Narrator;
use fablestep_session::application::runtime::StepRuntime;
use fablestep_store::memory::InMemorySessionRepository;
use fablestep_story::catalog::InMemoryCatalog;
use fablestep_test_support::{FixedClock, ScriptedMapper, ScriptedNarrator, fixtures};
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Fixed timestamp used across all integration tests.
fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock(
        chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 1, 15, 10, 0, 0).unwrap(),
    ))
}

/// Build the full app with an in-memory store and scripted model doubles.
pub fn build_test_app() -> Router {
    build_test_app_with(
        Arc::new(InMemorySessionRepository::new()),
        Arc::new(ScriptedMapper::mapping(MappedTargetType::Choice, "knock", 0.95)),
        Arc::new(ScriptedNarrator::new(&["The gate groans open."])),
    )
}

/// Build the full app with the given collaborators, as `main.rs` does.
pub fn build_test_app_with(
    repo: Arc<dyn SessionRepository>,
    mapper: Arc<dyn IntentMapper>,
    narrator: Arc<dyn Narrator>,
) -> Router {
    let mut catalog = InMemoryCatalog::new();
    catalog.publish(fixtures::lantern_keep()).unwrap();
    fablestep_api::app(AppState::new(StepRuntime {
        repo,
        catalog: Arc::new(catalog),
        mapper,
        narrator,
        clock: fixed_clock(),
        policy: StepPolicy::default(),
    }))
}

/// Send a POST request with a JSON body and optional idempotency key.
pub async fn post_json(
    app: Router,
    uri: &str,
    idempotency_key: Option<&str>,
    body: &serde_json::Value,
) -> (StatusCode, HeaderMap, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = idempotency_key {
        builder = builder.header("Idempotency-Key", key);
    }
    let request = builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, headers, json)
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, json)
}

/// Start a `lantern-keep@1` session and return its id.
pub async fn start_session(app: Router) -> String {
    let (status, _, json) = post_json(
        app,
        "/api/v1/sessions",
        None,
        &serde_json::json!({ "story_id": "lantern-keep", "story_version": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json["session_id"].as_str().unwrap().to_owned()
}
