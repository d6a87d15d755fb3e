//! Planner stage: given the extraction and current slots, choose which
//! tools to invoke and with what arguments.
//!
//! The LLM runs in JSON mode against the frozen `planner_v1` shape with one
//! repair pass and a 300 ms default budget. The planner is deliberately
//! trusting: cap enforcement, deduplication, and manifest validation are
//! the policy engine's job, so a misbehaving model cannot bypass them here.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::charla::extractor::Extraction;
use crate::charla::llm::{complete_with_repair, JsonModeClient, LlmError};
use crate::charla::manifest::ToolSpec;
use crate::charla::snapshot::Snapshot;

/// Schema identifier passed to the inference backend.
pub const PLANNER_SCHEMA: &str = "planner_v1";

/// Default planner budget, repair pass included.
pub const DEFAULT_PLANNER_TIMEOUT_MS: u64 = 300;

/// Hard cap on tool calls per turn, enforced downstream by policy.
pub const MAX_TOOL_CALLS: usize = 3;

/// One proposed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    /// JSON object of arguments. String values may reference the previous
    /// call's result fields with the `$prev.<field>` sigil.
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    /// Canonical identity used for deduplication: the tool name plus the
    /// argument object serialised with sorted keys.
    pub fn canonical_key(&self) -> String {
        format!(
            "{}::{}",
            self.tool,
            serde_json::to_string(&self.args).unwrap_or_default()
        )
    }
}

/// Ordered output of the planner stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub tool_calls: Vec<ToolCall>,
    /// Hint that the turn needs a substantive user-facing reply even after
    /// tools run.
    pub requires_user_response: bool,
}

impl Plan {
    /// A plan with no tool work.
    pub fn empty() -> Self {
        Self {
            tool_calls: Vec::new(),
            requires_user_response: true,
        }
    }
}

/// Planner stage errors, symmetric to the extractor's.
#[derive(Debug, Clone)]
pub enum PlannerError {
    LlmUnavailable(String),
    SchemaInvalid(String),
    Timeout,
}

impl std::fmt::Display for PlannerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerError::LlmUnavailable(msg) => write!(f, "planner llm unavailable: {}", msg),
            PlannerError::SchemaInvalid(msg) => write!(f, "planner schema invalid: {}", msg),
            PlannerError::Timeout => write!(f, "planner timeout"),
        }
    }
}

impl std::error::Error for PlannerError {}

impl From<LlmError> for PlannerError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(msg) => PlannerError::LlmUnavailable(msg),
            LlmError::Timeout => PlannerError::Timeout,
            LlmError::SchemaInvalid(msg) => PlannerError::SchemaInvalid(msg),
        }
    }
}

/// The planner stage.
pub struct Planner {
    client: Arc<dyn JsonModeClient>,
    timeout: Duration,
}

impl Planner {
    pub fn new(client: Arc<dyn JsonModeClient>) -> Self {
        Self {
            client,
            timeout: Duration::from_millis(DEFAULT_PLANNER_TIMEOUT_MS),
        }
    }

    /// Override the stage budget (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Produce the tool plan for this turn.
    pub async fn plan(
        &self,
        snapshot: &Snapshot,
        extraction: &Extraction,
        tools: &[ToolSpec],
    ) -> Result<Plan, PlannerError> {
        // Greetings never need tools; skip the round trip.
        if extraction.intent == crate::charla::extractor::Intent::Greeting {
            return Ok(Plan {
                tool_calls: Vec::new(),
                requires_user_response: true,
            });
        }

        let system = build_system_prompt(snapshot, tools);
        let user = build_user_prompt(snapshot, extraction);

        let result = tokio::time::timeout(
            self.timeout,
            complete_with_repair(
                self.client.as_ref(),
                PLANNER_SCHEMA,
                &system,
                &user,
                parse_plan,
            ),
        )
        .await;

        match result {
            Ok(Ok(plan)) => {
                log::debug!(
                    "planned {} tool call(s), requires_user_response={}",
                    plan.tool_calls.len(),
                    plan.requires_user_response
                );
                Ok(plan)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PlannerError::Timeout),
        }
    }
}

/// Render the manifest subset visible to the model: tool names with their
/// argument names and types only, never implementations.
fn render_tool_menu(tools: &[ToolSpec]) -> String {
    let mut menu = String::new();
    for tool in tools {
        let args = tool
            .args
            .iter()
            .map(|a| {
                let required = if a.required { "*" } else { "" };
                format!("{}{}: {:?}", a.name, required, a.arg_type).to_lowercase()
            })
            .collect::<Vec<_>>()
            .join(", ");
        menu.push_str(&format!("- {}({})\n", tool.name, args));
    }
    menu
}

fn build_system_prompt(snapshot: &Snapshot, tools: &[ToolSpec]) -> String {
    format!(
        "You plan tool calls for a {vertical} business assistant.\n\
         Reply with JSON only, shape: {{\"tool_calls\": [{{\"tool\": string, \"args\": object}}], \"requires_user_response\": bool}}.\n\
         At most {cap} calls. args keys must come from the tool's declared arguments (* marks required).\n\
         To pass a field from the previous call's result, use the string \"$prev.<field>\".\n\
         Do not request data already present in the recent observations.\n\
         Available tools:\n{menu}",
        vertical = snapshot.vertical,
        cap = MAX_TOOL_CALLS,
        menu = render_tool_menu(tools),
    )
}

fn build_user_prompt(snapshot: &Snapshot, extraction: &Extraction) -> String {
    let slots = serde_json::to_string(&snapshot.merged_slots(&extraction.slots))
        .unwrap_or_else(|_| "{}".to_string());
    let observations: Vec<Value> = snapshot
        .recent_observations
        .iter()
        .map(|o| {
            serde_json::json!({
                "tool": o.tool,
                "status": o.status.as_str(),
                "data": o.data,
            })
        })
        .collect();

    format!(
        "Intent: {} (confidence {:.2})\nSlots: {}\nRecent observations: {}\nUser message: {}",
        extraction.intent,
        extraction.confidence,
        slots,
        serde_json::to_string(&observations).unwrap_or_else(|_| "[]".to_string()),
        snapshot.user_text,
    )
}

/// Validate one raw reply against the `planner_v1` shape.
fn parse_plan(value: &Value) -> Result<Plan, String> {
    let obj = value.as_object().ok_or("reply is not a JSON object")?;

    let raw_calls = obj
        .get("tool_calls")
        .and_then(Value::as_array)
        .ok_or("missing array field `tool_calls`")?;

    let mut tool_calls = Vec::with_capacity(raw_calls.len());
    for raw in raw_calls {
        let call: ToolCall = serde_json::from_value(raw.clone())
            .map_err(|e| format!("bad tool call entry: {}", e))?;
        if call.tool.trim().is_empty() {
            return Err("tool call with empty name".to_string());
        }
        if !call.args.is_object() {
            return Err(format!("args for `{}` is not an object", call.tool));
        }
        tool_calls.push(call);
    }

    let requires_user_response = obj
        .get("requires_user_response")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(Plan {
        tool_calls,
        requires_user_response,
    })
}
