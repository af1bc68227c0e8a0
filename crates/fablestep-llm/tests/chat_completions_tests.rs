//! Adapter tests against a local stand-in for a chat-completions server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use fablestep_core::step::RouteDisposition;
use fablestep_llm::{ChatCompletionsClient, LlmConfig};
use fablestep_narrative::domain::mapper::{
    AllowedTarget, IntentMapper, MappedTargetType, MappingRequest,
};
use fablestep_narrative::domain::model::{
    EMPTY_OUTPUT, MALFORMED_OUTPUT, ModelOutcome, TRANSPORT_ERROR, UPSTREAM_REJECTED,
};
use fablestep_narrative::domain::narrator::{EpilogueRequest, NarrationRequest, Narrator};
use futures::StreamExt;
use serde_json::{Value, json};

#[derive(Default)]
struct Recorded {
    body: Option<Value>,
    authorization: Option<String>,
}

struct Canned {
    status: StatusCode,
    content_type: &'static str,
    body: String,
    recorded: Mutex<Recorded>,
}

async fn completions(
    State(canned): State<Arc<Canned>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    {
        let mut recorded = canned.recorded.lock().unwrap();
        recorded.body = serde_json::from_str(&body).ok();
        recorded.authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
    }
    (
        canned.status,
        [(header::CONTENT_TYPE, canned.content_type)],
        canned.body.clone(),
    )
}

async fn serve(
    status: StatusCode,
    content_type: &'static str,
    body: String,
) -> (String, Arc<Canned>) {
    let canned = Arc::new(Canned {
        status,
        content_type,
        body,
        recorded: Mutex::new(Recorded::default()),
    });
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(canned.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1"), canned)
}

fn client(base_url: &str) -> ChatCompletionsClient {
    let config = LlmConfig::new(base_url, "story-model")
        .with_api_key("sk-test")
        .with_timeout(Duration::from_secs(5));
    ChatCompletionsClient::new(config).unwrap()
}

fn completion(content: &str) -> String {
    json!({
        "id": "cmpl-1",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    })
    .to_string()
}

fn sse_delta(text: &str) -> String {
    format!("data: {}\n\n", json!({"choices": [{"delta": {"content": text}}]}))
}

fn mapping_request() -> MappingRequest {
    MappingRequest {
        story_id: "lantern-keep".into(),
        node_id: "gate".into(),
        scene: "The Gate. A barred gate under a guttering lantern.".into(),
        player_input: "I hammer on the gate".into(),
        allow_list: vec![AllowedTarget {
            target_type: MappedTargetType::Choice,
            target_id: "knock".into(),
            hint: "Knock on the gate".into(),
        }],
        attempt: 1,
        previous_error: None,
    }
}

fn narration_request() -> NarrationRequest {
    NarrationRequest {
        story_title: "Lantern Keep".into(),
        scene: "The Gate.".into(),
        next_scene: "The Courtyard.".into(),
        action_label: "Knock on the gate".into(),
        disposition: RouteDisposition::Executed,
        player_input: None,
        stat_changes: Vec::new(),
        event_text: None,
    }
}

#[tokio::test]
async fn test_map_intent_parses_json_answer() {
    // Arrange
    let answer =
        r#"{"target_type":"choice","target_id":"knock","confidence":0.92,"intensity_tier":2}"#;
    let (url, canned) = serve(StatusCode::OK, "application/json", completion(answer)).await;

    // Act
    let outcome = client(&url).map_intent(&mapping_request()).await;

    // Assert
    let ModelOutcome::Ok(mapping) = outcome else {
        panic!("expected a mapping, got {outcome:?}");
    };
    assert_eq!(mapping.target_id, "knock");
    assert_eq!(mapping.intensity_tier, 2);
    let recorded = canned.recorded.lock().unwrap();
    assert_eq!(recorded.authorization.as_deref(), Some("Bearer sk-test"));
    let body = recorded.body.as_ref().unwrap();
    assert_eq!(body["model"], "story-model");
    assert_eq!(body["stream"], false);
    assert_eq!(body["response_format"]["type"], "json_object");
}

#[tokio::test]
async fn test_map_intent_prose_answer_is_retryable_malformed() {
    let (url, _) = serve(StatusCode::OK, "application/json", completion("Knock, probably.")).await;

    let outcome = client(&url).map_intent(&mapping_request()).await;

    assert!(matches!(outcome, ModelOutcome::RetryableFailure(f) if f.code == MALFORMED_OUTPUT));
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let (url, _) = serve(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "overloaded".into()).await;

    let outcome = client(&url).map_intent(&mapping_request()).await;

    assert!(matches!(outcome, ModelOutcome::RetryableFailure(f) if f.code == TRANSPORT_ERROR));
}

#[tokio::test]
async fn test_unauthorized_is_fatal() {
    let body = r#"{"error":"bad key"}"#.to_owned();
    let (url, _) = serve(StatusCode::UNAUTHORIZED, "application/json", body).await;

    let outcome = client(&url).narrate(&narration_request()).await;

    assert!(matches!(outcome, ModelOutcome::FatalFailure(f) if f.code == UPSTREAM_REJECTED));
}

#[tokio::test]
async fn test_unreachable_server_is_retryable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let outcome = client(&format!("http://{addr}/v1")).map_intent(&mapping_request()).await;

    assert!(matches!(outcome, ModelOutcome::RetryableFailure(f) if f.code == TRANSPORT_ERROR));
}

#[tokio::test]
async fn test_narrate_streams_deltas_until_done() {
    // Arrange
    let body = format!(
        "{}{}{}data: [DONE]\n\n",
        sse_delta("The gate "),
        sse_delta("groans "),
        sse_delta("open.")
    );
    let (url, canned) = serve(StatusCode::OK, "text/event-stream", body).await;

    // Act
    let ModelOutcome::Ok(stream) = client(&url).narrate(&narration_request()).await else {
        panic!("narration did not start");
    };
    let deltas: Vec<String> = stream.map(Result::unwrap).collect().await;

    // Assert
    assert_eq!(deltas.concat(), "The gate groans open.");
    assert_eq!(canned.recorded.lock().unwrap().body.as_ref().unwrap()["stream"], true);
}

#[tokio::test]
async fn test_narrate_surfaces_malformed_chunk() {
    let (url, _) = serve(StatusCode::OK, "text/event-stream", "data: nonsense\n\n".into()).await;

    let ModelOutcome::Ok(stream) = client(&url).narrate(&narration_request()).await else {
        panic!("narration did not start");
    };
    let items: Vec<_> = stream.collect().await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap_err().code, MALFORMED_OUTPUT);
}

#[tokio::test]
async fn test_narrate_body_cut_before_done_ends_with_transport_error() {
    // Arrange
    let body = format!("{}{}", sse_delta("The gate "), sse_delta("groans"));
    let (url, _) = serve(StatusCode::OK, "text/event-stream", body).await;

    // Act
    let ModelOutcome::Ok(stream) = client(&url).narrate(&narration_request()).await else {
        panic!("narration did not start");
    };
    let items: Vec<_> = stream.collect().await;

    // Assert
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_deref(), Ok("The gate "));
    assert_eq!(items[1].as_deref(), Ok("groans"));
    assert_eq!(items[2].as_ref().unwrap_err().code, TRANSPORT_ERROR);
}

#[tokio::test]
async fn test_epilogue_returns_completion_text() {
    let (url, _) = serve(
        StatusCode::OK,
        "application/json",
        completion("Dawn found you on the road home."),
    )
    .await;
    let request = EpilogueRequest {
        story_title: "Lantern Keep".into(),
        ending_title: "Dawn".into(),
        outcome: "victory".into(),
        forced_by_timeout: false,
        recap: vec!["You earned the keeper's trust.".into()],
    };

    let outcome = client(&url).epilogue(&request).await;

    assert!(matches!(
        outcome,
        ModelOutcome::Ok(text) if text == "Dawn found you on the road home."
    ));
}

#[tokio::test]
async fn test_blank_completion_is_empty_output() {
    let (url, _) = serve(StatusCode::OK, "application/json", completion("  ")).await;
    let request = EpilogueRequest {
        story_title: "Lantern Keep".into(),
        ending_title: "Dawn".into(),
        outcome: "victory".into(),
        forced_by_timeout: true,
        recap: Vec::new(),
    };

    let outcome = client(&url).epilogue(&request).await;

    assert!(matches!(outcome, ModelOutcome::RetryableFailure(f) if f.code == EMPTY_OUTPUT));
}
