//! HTTP entrypoint and request adapter.
//!
//! One primary endpoint, `POST /orchestrator/decide`, plus a liveness
//! probe at `GET /healthz`. The handler validates headers and body, builds
//! the immutable [`Snapshot`], runs the pipeline, and maps the outcome to
//! a status code:
//!
//! - 200: normal answers, including degraded ones
//! - 400: malformed JSON, missing headers, over-long text
//! - 409: policy denied the plan (the assistant text is still included)
//! - 429: the worker pool is saturated
//!
//! Backpressure is a semaphore sized to the LLM backend's concurrency
//! limit; a saturated pool rejects immediately so the outer workflow
//! engine can apply its own backoff.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::charla::pipeline::Pipeline;
use crate::charla::snapshot::{
    Observation, SlotValue, Snapshot, Vertical, MAX_USER_TEXT_CHARS,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, max_concurrent_requests: usize) -> Self {
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
        }
    }
}

/// Wire shape of the decide request body.
#[derive(Debug, Deserialize)]
struct DecideRequestBody {
    user_message: UserMessageBody,
    context: ContextBody,
    #[serde(default)]
    state: StateBody,
}

#[derive(Debug, Deserialize)]
struct UserMessageBody {
    text: String,
    #[serde(default)]
    #[allow(dead_code)]
    message_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    from: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    to: Option<String>,
    #[serde(default)]
    locale: Option<String>,
    #[serde(default)]
    timestamp_iso: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContextBody {
    #[serde(default)]
    #[allow(dead_code)]
    platform: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    channel: Option<String>,
    #[serde(default)]
    business_name: Option<String>,
    vertical: Vertical,
}

#[derive(Debug, Default, Deserialize)]
struct StateBody {
    #[serde(default)]
    fsm_state: Option<String>,
    #[serde(default)]
    slots: HashMap<String, SlotValue>,
    #[serde(default)]
    last_k_observations: Vec<Observation>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/orchestrator/decide", post(decide))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(
    addr: &str,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("orchestrator listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn decide(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    // Backpressure first: reject before doing any work.
    let _permit = match state.permits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            log::warn!("worker pool saturated, rejecting request");
            return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
        }
    };

    let snapshot = match build_snapshot(&headers, &body) {
        Ok(snapshot) => snapshot,
        Err(message) => {
            log::warn!("invalid decide request: {}", message);
            return error_response(StatusCode::BAD_REQUEST, "invalid_request");
        }
    };

    let response = state.pipeline.decide(snapshot).await;
    let status = if response.policy_denied {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    (status, Json(response)).into_response()
}

fn error_response(status: StatusCode, kind: &str) -> Response {
    (status, Json(serde_json::json!({ "error": kind }))).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| format!("missing header {}", name))
}

/// Validate headers and body and assemble the immutable snapshot.
fn build_snapshot(headers: &HeaderMap, body: &Bytes) -> Result<Snapshot, String> {
    let workspace_id = header(headers, "x-workspace-id")?;
    Uuid::parse_str(workspace_id)
        .map_err(|_| format!("x-workspace-id `{}` is not a UUID", workspace_id))?;
    let conversation_id = header(headers, "x-conversation-id")?;
    let request_id = header(headers, "x-request-id")?;
    let channel = header(headers, "x-channel")?;

    let parsed: DecideRequestBody =
        serde_json::from_slice(body).map_err(|e| format!("malformed body: {}", e))?;

    if parsed.user_message.text.chars().count() > MAX_USER_TEXT_CHARS {
        return Err(format!(
            "user text exceeds {} chars",
            MAX_USER_TEXT_CHARS
        ));
    }

    if let Some(raw) = &parsed.user_message.timestamp_iso {
        if chrono::DateTime::parse_from_rfc3339(raw).is_err() {
            log::warn!("unparseable timestamp_iso `{}`, ignoring", raw);
        }
    }

    let snapshot = Snapshot::new(
        workspace_id,
        channel,
        conversation_id,
        request_id,
        parsed.context.vertical,
    )
    .with_business_name(parsed.context.business_name.unwrap_or_default())
    .with_locale(
        parsed
            .user_message
            .locale
            .unwrap_or_else(|| "es".to_string()),
    )
    .with_user_text(parsed.user_message.text)
    .with_fsm_state(parsed.state.fsm_state)
    .with_slots(parsed.state.slots)
    .with_recent_observations(parsed.state.last_k_observations);

    snapshot.validate().map_err(|e| e.to_string())?;
    Ok(snapshot)
}
