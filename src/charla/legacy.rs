//! Legacy single-shot fallback path.
//!
//! When the canary routes a request to `legacy`, one JSON-mode call against
//! the documented `legacy_v1` shape produces the whole turn:
//! `{assistant_text, tool_calls, patch}`. No policy validation applies;
//! the path exists only so the structured pipeline can roll out behind a
//! switch with instant rollback.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::charla::llm::{complete_with_repair, JsonModeClient, LlmError};
use crate::charla::planner::ToolCall;
use crate::charla::reducer::Patch;
use crate::charla::snapshot::{SlotMap, Snapshot};

/// Schema identifier passed to the inference backend.
pub const LEGACY_SCHEMA: &str = "legacy_v1";

/// Default budget for the single shot.
pub const DEFAULT_LEGACY_TIMEOUT_MS: u64 = 5_000;

/// Everything the legacy call yields for one turn.
#[derive(Debug, Clone)]
pub struct LegacyOutcome {
    pub assistant_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub patch: Patch,
}

/// Errors from the legacy path, same taxonomy as the structured stages.
#[derive(Debug, Clone)]
pub enum LegacyError {
    LlmUnavailable(String),
    SchemaInvalid(String),
    Timeout,
}

impl std::fmt::Display for LegacyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegacyError::LlmUnavailable(msg) => write!(f, "legacy llm unavailable: {}", msg),
            LegacyError::SchemaInvalid(msg) => write!(f, "legacy schema invalid: {}", msg),
            LegacyError::Timeout => write!(f, "legacy timeout"),
        }
    }
}

impl std::error::Error for LegacyError {}

impl From<LlmError> for LegacyError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(msg) => LegacyError::LlmUnavailable(msg),
            LlmError::Timeout => LegacyError::Timeout,
            LlmError::SchemaInvalid(msg) => LegacyError::SchemaInvalid(msg),
        }
    }
}

/// Wire shape of a `legacy_v1` reply.
#[derive(Debug, Deserialize)]
struct LegacyReply {
    assistant_text: String,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
    #[serde(default)]
    patch: LegacyPatch,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyPatch {
    #[serde(default)]
    slots: SlotMap,
    #[serde(default)]
    slots_to_remove: Vec<String>,
    #[serde(default)]
    cache_invalidation_keys: Vec<String>,
}

/// The legacy responder.
pub struct LegacyResponder {
    client: Arc<dyn JsonModeClient>,
    timeout: Duration,
}

impl LegacyResponder {
    pub fn new(client: Arc<dyn JsonModeClient>) -> Self {
        Self {
            client,
            timeout: Duration::from_millis(DEFAULT_LEGACY_TIMEOUT_MS),
        }
    }

    /// Override the call budget (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Produce the full turn with one JSON-mode call plus one repair pass.
    pub async fn respond(&self, snapshot: &Snapshot) -> Result<LegacyOutcome, LegacyError> {
        let system = format!(
            "You are the WhatsApp assistant for {business} ({vertical}).\n\
             Reply with JSON only, shape: {{\"assistant_text\": string, \
             \"tool_calls\": [{{\"tool\": string, \"args\": object}}], \
             \"patch\": {{\"slots\": object, \"slots_to_remove\": [string], \
             \"cache_invalidation_keys\": [string]}}}}.\n\
             Keep assistant_text short and in the user's language.",
            business = snapshot.business_name,
            vertical = snapshot.vertical,
        );
        let slots =
            serde_json::to_string(&snapshot.slots).unwrap_or_else(|_| "{}".to_string());
        let user = format!(
            "Current slots: {}\nUser message ({}): {}",
            slots, snapshot.locale, snapshot.user_text
        );

        let result = tokio::time::timeout(
            self.timeout,
            complete_with_repair(
                self.client.as_ref(),
                LEGACY_SCHEMA,
                &system,
                &user,
                parse_legacy,
            ),
        )
        .await;

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LegacyError::Timeout),
        }
    }
}

/// Validate one raw reply against the `legacy_v1` shape.
fn parse_legacy(value: &Value) -> Result<LegacyOutcome, String> {
    let reply: LegacyReply =
        serde_json::from_value(value.clone()).map_err(|e| format!("bad legacy reply: {}", e))?;

    if reply.assistant_text.trim().is_empty() {
        return Err("assistant_text is empty".to_string());
    }

    let mut patch = Patch::empty();
    for (key, value) in reply.patch.slots {
        patch.set(key, value);
    }
    // Keep the disjointness invariant even for model-authored patches.
    let removals: Vec<String> = reply
        .patch
        .slots_to_remove
        .into_iter()
        .filter(|key| !patch.slots_set.contains_key(key))
        .collect();
    patch.slots_unset = removals;
    patch.cache_invalidation_keys = reply.patch.cache_invalidation_keys;

    Ok(LegacyOutcome {
        assistant_text: reply.assistant_text,
        tool_calls: reply.tool_calls,
        patch,
    })
}
