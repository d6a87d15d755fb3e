//! HTTP entrypoint suite: status-code mapping, validation, backpressure.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::util::ServiceExt;

use charla::charla::config::OrchestratorConfig;
use charla::charla::extractor::EXTRACTOR_SCHEMA;
use charla::charla::manifest::{Manifest, ManifestStore};
use charla::charla::pipeline::{Pipeline, StageClients};
use charla::charla::planner::PLANNER_SCHEMA;
use charla::charla::server::{router, AppState};

use common::{MockLlm, MockTransport};

const WORKSPACE: &str = "8f1f9e1e-9f43-4e9f-9a06-5a9a1d1d8f50";

fn app_state(llm: MockLlm) -> AppState {
    let config = OrchestratorConfig {
        extractor_timeout_ms: 2_000,
        planner_timeout_ms: 2_000,
        fallback_to_llm: false,
        ..OrchestratorConfig::default()
    };
    let store = Arc::new(ManifestStore::new(Manifest::builtin()));
    let pipeline = Pipeline::new(
        &config,
        StageClients::shared(Arc::new(llm)),
        Arc::new(MockTransport::new()),
        store,
    );
    AppState::new(Arc::new(pipeline), 4)
}

fn decide_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/orchestrator/decide")
        .header("content-type", "application/json")
        .header("x-workspace-id", WORKSPACE)
        .header("x-conversation-id", "conv-1")
        .header("x-request-id", "req-1")
        .header("x-channel", "whatsapp")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn greeting_body() -> serde_json::Value {
    json!({
        "user_message": {"text": "hola", "locale": "es-AR"},
        "context": {"business_name": "Peluquería Sol", "vertical": "services"},
        "state": {"fsm_state": null, "slots": {}, "last_k_observations": []}
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_answers_ok() {
    let state = app_state(MockLlm::new());
    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn greeting_round_trip_returns_the_decide_shape() {
    let llm = MockLlm::new().reply(
        EXTRACTOR_SCHEMA,
        json!({"intent": "greeting", "confidence": 0.97, "slots": {}}),
    );
    let state = app_state(llm);
    let response = router(state)
        .oneshot(decide_request(greeting_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["assistant"]["text"].as_str().unwrap().contains("Peluquería Sol"));
    assert_eq!(body["tool_calls"].as_array().unwrap().len(), 0);
    assert_eq!(body["patch"]["slots"]["greeted"], true);
    assert_eq!(body["telemetry"]["route"], "slm_pipeline");
    assert_eq!(body["telemetry"]["intent"], "greeting");
    assert!(body["telemetry"]["total_ms"].is_u64());
}

#[tokio::test]
async fn missing_header_is_a_400() {
    let state = app_state(MockLlm::new());
    let request = Request::builder()
        .method("POST")
        .uri("/orchestrator/decide")
        .header("content-type", "application/json")
        .header("x-workspace-id", WORKSPACE)
        // no conversation / request / channel headers
        .body(Body::from(greeting_body().to_string()))
        .unwrap();

    let response = router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn malformed_json_is_a_400() {
    let state = app_state(MockLlm::new());
    let request = Request::builder()
        .method("POST")
        .uri("/orchestrator/decide")
        .header("content-type", "application/json")
        .header("x-workspace-id", WORKSPACE)
        .header("x-conversation-id", "conv-1")
        .header("x-request-id", "req-1")
        .header("x-channel", "whatsapp")
        .body(Body::from("{not json"))
        .unwrap();

    let response = router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn over_long_text_is_a_400() {
    let state = app_state(MockLlm::new());
    let body = json!({
        "user_message": {"text": "x".repeat(5000)},
        "context": {"vertical": "services"}
    });
    let response = router(state).oneshot(decide_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn policy_deny_is_a_409_with_assistant_text() {
    // A repeat guardrail offence turns into a deny.
    let llm = MockLlm::new()
        .reply(
            EXTRACTOR_SCHEMA,
            json!({"intent": "book", "confidence": 0.95, "slots": {
                "service_type": "Corte", "preferred_date": "2026-08-02",
                "preferred_time": "03:00", "client_name": "Juan",
                "client_email": "juan@x.com"
            }}),
        )
        .reply(
            PLANNER_SCHEMA,
            json!({
                "tool_calls": [{"tool": "create_booking", "args": {
                    "service_type": "Corte", "preferred_date": "2026-08-02",
                    "preferred_time": "03:00", "client_name": "Juan",
                    "client_email": "juan@x.com"
                }}],
                "requires_user_response": true
            }),
        );
    let state = app_state(llm);

    let body = json!({
        "user_message": {"text": "reservá a las 3am", "locale": "es-AR"},
        "context": {"business_name": "Peluquería Sol", "vertical": "services"},
        "state": {"slots": {"_guardrail_offences": 1}}
    });
    let response = router(state).oneshot(decide_request(body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert!(!body["assistant"]["text"].as_str().unwrap().is_empty());
    assert_eq!(body["tool_calls"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn saturated_worker_pool_is_a_429() {
    let state = app_state(MockLlm::new());

    // Drain every permit so the next request finds the pool full.
    let permits = state.permits.clone();
    let held = permits.acquire_many_owned(4).await.unwrap();

    let response = router(state)
        .oneshot(decide_request(greeting_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    drop(held);
}
