//! Tool broker: executes a validated call list against the workflow
//! engine's tool endpoint with per-call resource control.
//!
//! Calls are grouped into dependency classes: a call depends on an earlier
//! one iff its args reference a result field with the `$prev.<field>`
//! sigil, or the manifest declares an `after:` link to a tool that appears
//! earlier in the plan. Classes run sequentially; calls inside one class
//! run in parallel (each on its own task, bounded by a per-request
//! semaphore). Observations always come back in input order regardless of
//! completion order, so the reducer sees a deterministic sequence.
//!
//! Per call the broker applies, in order: the circuit-breaker check, the
//! idempotency key derivation, and an attempt loop with per-attempt
//! timeout, exponential backoff with jitter on transport/5xx failures, and
//! no retry on 4xx. A global request deadline cuts everything short.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::charla::breaker::CircuitBreakerRegistry;
use crate::charla::manifest::{IdempotencyScheme, ToolSpec};
use crate::charla::planner::ToolCall;
use crate::charla::snapshot::{Observation, Snapshot};

/// Default bound on in-flight tool calls per request.
pub const DEFAULT_MAX_PARALLEL: usize = 8;

/// Margin under which a call is not even started against the deadline.
pub const DEADLINE_MARGIN: Duration = Duration::from_millis(50);

/// Sigil marking an argument that references the previous call's result.
pub const PREV_SIGIL: &str = "$prev.";

/// Wire shape of the tool endpoint's answer.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<ToolErrorBody>,
}

/// Structured error half of a tool response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolErrorBody {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

/// One outbound tool invocation as sent to the workflow engine.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Value,
    pub idempotency_key: String,
    pub workspace_id: String,
    pub conversation_id: String,
}

/// Transport-level failures distinguished by their retry semantics.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Non-2xx HTTP status.
    Status(u16),
    /// The wire was unusable (connect, DNS, reset).
    Network(String),
}

impl TransportError {
    /// 5xx and wire errors are worth retrying; 4xx is the caller's fault.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Status(code) => *code >= 500,
            TransportError::Network(_) => true,
        }
    }

    fn kind(&self) -> String {
        match self {
            TransportError::Status(code) => format!("http_{}", code),
            TransportError::Network(_) => "network".to_string(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Status(code) => write!(f, "tool endpoint answered {}", code),
            TransportError::Network(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Seam to the workflow engine's tool-execution endpoint.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResponse, TransportError>;
}

/// Reqwest-backed transport posting to the engine's execute endpoint.
pub struct HttpToolTransport {
    http: reqwest::Client,
    execute_url: String,
}

impl HttpToolTransport {
    pub fn new(execute_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            execute_url: execute_url.into(),
        }
    }

    /// Share an existing connection pool (builder pattern).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResponse, TransportError> {
        let response = self
            .http
            .post(&self.execute_url)
            .json(&invocation)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        // Any 2xx body that does not parse as the documented shape is an
        // application failure, not a transport retry candidate.
        match response.json::<ToolResponse>().await {
            Ok(parsed) => Ok(parsed),
            Err(e) => Ok(ToolResponse {
                ok: false,
                data: None,
                error: Some(ToolErrorBody {
                    kind: "bad_response".to_string(),
                    message: e.to_string(),
                }),
            }),
        }
    }
}

/// The tool broker.
pub struct ToolBroker {
    transport: Arc<dyn ToolTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    max_parallel: usize,
}

impl ToolBroker {
    pub fn new(transport: Arc<dyn ToolTransport>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            transport,
            breakers,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    /// Override the per-request parallelism bound (builder pattern).
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Execute the validated call list. Returns one observation per input
    /// call, in input order.
    pub async fn execute(
        &self,
        calls: &[ToolCall],
        tools: &[ToolSpec],
        snapshot: &Snapshot,
        deadline: Instant,
    ) -> Vec<Observation> {
        let classes = dependency_classes(calls, tools);
        let mut results: Vec<Option<Observation>> = vec![None; calls.len()];
        let limiter = Arc::new(Semaphore::new(self.max_parallel));

        let class_count = classes.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        for class in 0..class_count {
            let mut handles = Vec::new();
            for (idx, call) in calls.iter().enumerate() {
                if classes[idx] != class {
                    continue;
                }

                let spec = match tools.iter().find(|t| t.name == call.tool) {
                    Some(spec) => spec.clone(),
                    None => {
                        // Policy should have filtered this; refusing here
                        // keeps the ordering invariant intact anyway.
                        results[idx] =
                            Some(Observation::denied(call.tool.clone(), "unknown_tool"));
                        continue;
                    }
                };

                let prev_data = if idx > 0 {
                    results[idx - 1]
                        .as_ref()
                        .and_then(|o| o.data.clone())
                } else {
                    None
                };
                let args = resolve_prev_refs(&call.args, prev_data.as_ref());

                let call = ToolCall::new(call.tool.clone(), args);
                let transport = Arc::clone(&self.transport);
                let breakers = Arc::clone(&self.breakers);
                let limiter = Arc::clone(&limiter);
                let request_id = snapshot.request_id.clone();
                let workspace_id = snapshot.workspace_id.clone();
                let conversation_id = snapshot.conversation_id.clone();

                handles.push((
                    idx,
                    tokio::spawn(async move {
                        // The semaphore is never closed, so this cannot fail.
                        let _permit = limiter.acquire_owned().await.ok();
                        run_call(
                            transport,
                            breakers,
                            call,
                            spec,
                            request_id,
                            workspace_id,
                            conversation_id,
                            deadline,
                        )
                        .await
                    }),
                ));
            }

            let joined = join_all(
                handles
                    .into_iter()
                    .map(|(idx, handle)| async move { (idx, handle.await) }),
            )
            .await;
            for (idx, outcome) in joined {
                let observation = match outcome {
                    Ok(observation) => observation,
                    Err(e) => {
                        log::error!("tool task join error: {}", e);
                        Observation::failed(calls[idx].tool.clone(), "join_error", 0, 0)
                    }
                };
                results[idx] = Some(observation);
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| Observation::denied(calls[idx].tool.clone(), "not_run"))
            })
            .collect()
    }
}

/// Derive the idempotency key for one call.
pub fn idempotency_key(spec: &ToolSpec, request_id: &str, args: &Value) -> String {
    match spec.idempotency {
        IdempotencyScheme::RequestId => request_id.to_string(),
        IdempotencyScheme::ArgHash => arg_hash(&spec.name, args),
    }
}

/// Stable hash of the canonical argument object. serde_json serialises
/// object keys in sorted order, so equal argument sets hash equally.
fn arg_hash(tool: &str, args: &Value) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Assign each call its dependency class. Class 0 runs first; a call in
/// class N waits for every class below N.
fn dependency_classes(calls: &[ToolCall], tools: &[ToolSpec]) -> Vec<usize> {
    let mut classes = vec![0usize; calls.len()];
    for idx in 0..calls.len() {
        let mut class = 0usize;

        if idx > 0 && references_prev(&calls[idx].args) {
            class = class.max(classes[idx - 1] + 1);
        }

        if let Some(spec) = tools.iter().find(|t| t.name == calls[idx].tool) {
            for dependency in &spec.after {
                if let Some(dep_idx) = calls[..idx].iter().position(|c| &c.tool == dependency) {
                    class = class.max(classes[dep_idx] + 1);
                }
            }
        }

        classes[idx] = class;
    }
    classes
}

/// Does any string value inside the args reference `$prev.`?
fn references_prev(args: &Value) -> bool {
    match args {
        Value::String(s) => s.starts_with(PREV_SIGIL),
        Value::Array(items) => items.iter().any(references_prev),
        Value::Object(map) => map.values().any(references_prev),
        _ => false,
    }
}

/// Replace `$prev.<field>` string values with fields from the previous
/// call's result data. Unresolvable references are left untouched so the
/// tool endpoint can report them meaningfully.
fn resolve_prev_refs(args: &Value, prev_data: Option<&Value>) -> Value {
    match args {
        Value::String(s) if s.starts_with(PREV_SIGIL) => {
            let field = &s[PREV_SIGIL.len()..];
            prev_data
                .and_then(|data| data.get(field))
                .cloned()
                .unwrap_or_else(|| args.clone())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_prev_refs(item, prev_data))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_prev_refs(v, prev_data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Backoff for the n-th failed attempt (1-based): `base * 2^(n-1)` with a
/// 0.5 to 1.5 jitter multiplier.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((exponential as f64 * jitter) as u64)
}

#[allow(clippy::too_many_arguments)]
async fn run_call(
    transport: Arc<dyn ToolTransport>,
    breakers: Arc<CircuitBreakerRegistry>,
    call: ToolCall,
    spec: ToolSpec,
    request_id: String,
    workspace_id: String,
    conversation_id: String,
    deadline: Instant,
) -> Observation {
    if !breakers.should_allow(&spec.name, &spec.circuit) {
        log::info!("skipping '{}', circuit open", spec.name);
        return Observation::circuit_open(spec.name.clone());
    }

    let key = idempotency_key(&spec, &request_id, &call.args);
    let tool_timeout = Duration::from_millis(spec.timeout_ms);
    let max_attempts = spec.retries.max_attempts.max(1);

    let mut last_latency = 0u64;
    let mut timed_out = false;
    let mut last_error = String::from("exhausted");

    for attempt in 1..=max_attempts {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining <= DEADLINE_MARGIN {
            log::warn!("'{}' not started, request deadline imminent", spec.name);
            return Observation::timeout(spec.name.clone(), last_latency, attempt - 1);
        }

        let invocation = ToolInvocation {
            tool: spec.name.clone(),
            args: call.args.clone(),
            idempotency_key: key.clone(),
            workspace_id: workspace_id.clone(),
            conversation_id: conversation_id.clone(),
        };

        let budget = tool_timeout.min(remaining);
        let started = Instant::now();
        let outcome = tokio::time::timeout(budget, transport.invoke(invocation)).await;
        let latency = started.elapsed().as_millis() as u64;
        last_latency = latency;

        match outcome {
            Ok(Ok(response)) if response.ok => {
                breakers.record_success(&spec.name);
                log::info!(
                    target: "telemetry",
                    "tool_attempt tool={} attempt={} outcome=ok latency_ms={}",
                    spec.name, attempt, latency
                );
                return Observation::ok(
                    spec.name.clone(),
                    response.data.unwrap_or(Value::Null),
                    latency,
                    attempt,
                );
            }
            Ok(Ok(response)) => {
                // Application-level failure: the endpoint understood us and
                // said no. Retrying would repeat the same answer.
                let kind = response
                    .error
                    .map(|e| e.kind)
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| "tool_error".to_string());
                log::info!(
                    target: "telemetry",
                    "tool_attempt tool={} attempt={} outcome=failed kind={} latency_ms={}",
                    spec.name, attempt, kind, latency
                );
                breakers.record_failure(&spec.name, &spec.circuit);
                return Observation::failed(spec.name.clone(), kind, latency, attempt);
            }
            Ok(Err(transport_error)) => {
                timed_out = false;
                last_error = transport_error.kind();
                log::info!(
                    target: "telemetry",
                    "tool_attempt tool={} attempt={} outcome={} latency_ms={}",
                    spec.name, attempt, last_error, latency
                );
                if !transport_error.is_retryable() {
                    breakers.record_failure(&spec.name, &spec.circuit);
                    return Observation::failed(spec.name.clone(), last_error, latency, attempt);
                }
                if attempt < max_attempts {
                    let delay = backoff_delay(spec.retries.base_backoff_ms, attempt)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    tokio::time::sleep(delay).await;
                }
            }
            Err(_elapsed) => {
                timed_out = true;
                last_error = "timeout".to_string();
                log::info!(
                    target: "telemetry",
                    "tool_attempt tool={} attempt={} outcome=timeout latency_ms={}",
                    spec.name, attempt, latency
                );
                // Timeouts retry without backoff while attempts remain.
            }
        }
    }

    breakers.record_failure(&spec.name, &spec.circuit);
    if timed_out {
        Observation::timeout(spec.name.clone(), last_latency, max_attempts)
    } else {
        Observation::failed(spec.name.clone(), last_error, last_latency, max_attempts)
    }
}
