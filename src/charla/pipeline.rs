//! Pipeline orchestrator: the per-request state machine that wires the
//! canary router, the structured stages, and the legacy fallback into one
//! `decide` operation.
//!
//! ```text
//! RECEIVED → ROUTED → (slm: EXTRACTED → PLANNED → POLICY_EVALUATED →
//!                           EXECUTED → REDUCED → COMPOSED → RETURNED)
//!                   → (legacy: LEGACY_CALLED → RETURNED)
//! ```
//!
//! Every transition emits a telemetry span. There is no pipeline-level
//! retry; retries live inside the broker. Any stage failure degrades the
//! request to a stock reply (optionally via the legacy single-shot when
//! `fallback_to_llm` is on), never to a 5xx with an empty body.
//!
//! Deadline propagation is strict: a stage that would start within 50 ms
//! of the total deadline is not invoked and reports `timeout`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::charla::broker::{ToolBroker, ToolTransport, DEADLINE_MARGIN};
use crate::charla::canary::{self, CanaryConfig, Route};
use crate::charla::config::OrchestratorConfig;
use crate::charla::extractor::{Extractor, ExtractorError, Intent};
use crate::charla::legacy::{LegacyError, LegacyResponder};
use crate::charla::llm::JsonModeClient;
use crate::charla::manifest::ManifestStore;
use crate::charla::nlg::{self, NlgInput, ResponseBuilder};
use crate::charla::planner::{Planner, PlannerError, ToolCall};
use crate::charla::policy::{Decision, PolicyEngine, GUARDRAIL_OFFENCES_SLOT};
use crate::charla::reducer::{reduce, Patch};
use crate::charla::snapshot::{SlotValue, Snapshot};
use crate::charla::telemetry::{RouteCounters, StageTimer, Telemetry};

/// User-visible half of a decide response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantReply {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_replies: Option<Vec<String>>,
}

/// The full per-request answer handed back to the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideResponse {
    pub assistant: AssistantReply,
    /// Externally observable side-effecting calls; read-only calls the
    /// broker already executed are not repeated here.
    pub tool_calls: Vec<ToolCall>,
    pub patch: Patch,
    pub telemetry: Telemetry,
    /// True when policy denied the plan; the entrypoint maps it to 409.
    #[serde(skip)]
    pub policy_denied: bool,
}

/// Stage failures that degrade the whole request.
#[derive(Debug)]
pub enum PipelineError {
    Extractor(ExtractorError),
    Planner(PlannerError),
    Legacy(LegacyError),
    /// A stage could not start within the remaining deadline budget.
    DeadlineExceeded(&'static str),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Extractor(e) => write!(f, "{}", e),
            PipelineError::Planner(e) => write!(f, "{}", e),
            PipelineError::Legacy(e) => write!(f, "{}", e),
            PipelineError::DeadlineExceeded(stage) => {
                write!(f, "deadline exceeded before stage {}", stage)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

/// One JSON-mode client per LLM-backed stage, so each stage can point at
/// its own model.
#[derive(Clone)]
pub struct StageClients {
    pub extractor: Arc<dyn JsonModeClient>,
    pub planner: Arc<dyn JsonModeClient>,
    pub response: Arc<dyn JsonModeClient>,
}

impl StageClients {
    /// Use a single client for every stage.
    pub fn shared(client: Arc<dyn JsonModeClient>) -> Self {
        Self {
            extractor: client.clone(),
            planner: client.clone(),
            response: client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Received,
    Routed,
    Extracted,
    Planned,
    PolicyEvaluated,
    Executed,
    Reduced,
    Composed,
    LegacyCalled,
    Degraded,
    Returned,
}

impl State {
    fn as_str(&self) -> &'static str {
        match self {
            State::Received => "received",
            State::Routed => "routed",
            State::Extracted => "extracted",
            State::Planned => "planned",
            State::PolicyEvaluated => "policy_evaluated",
            State::Executed => "executed",
            State::Reduced => "reduced",
            State::Composed => "composed",
            State::LegacyCalled => "legacy_called",
            State::Degraded => "degraded",
            State::Returned => "returned",
        }
    }
}

/// The decision pipeline.
pub struct Pipeline {
    extractor: Extractor,
    planner: Planner,
    policy: PolicyEngine,
    broker: ToolBroker,
    nlg: ResponseBuilder,
    legacy: LegacyResponder,
    manifest: Arc<ManifestStore>,
    canary: CanaryConfig,
    counters: RouteCounters,
    total_timeout: Duration,
    broker_timeout: Duration,
    fallback_to_llm: bool,
}

impl Pipeline {
    pub fn new(
        config: &OrchestratorConfig,
        clients: StageClients,
        transport: Arc<dyn ToolTransport>,
        manifest: Arc<ManifestStore>,
    ) -> Self {
        let breakers = Arc::new(crate::charla::breaker::CircuitBreakerRegistry::new());
        Self {
            extractor: Extractor::new(clients.extractor)
                .with_timeout(Duration::from_millis(config.extractor_timeout_ms)),
            planner: Planner::new(clients.planner)
                .with_timeout(Duration::from_millis(config.planner_timeout_ms)),
            policy: PolicyEngine::new().with_confidence_threshold(config.confidence_threshold),
            broker: ToolBroker::new(transport, breakers)
                .with_max_parallel(config.max_parallel_tools),
            nlg: ResponseBuilder::new().with_llm(clients.response.clone()),
            legacy: LegacyResponder::new(clients.response),
            manifest,
            canary: config.canary(),
            counters: RouteCounters::new(),
            total_timeout: Duration::from_millis(config.total_timeout_ms),
            broker_timeout: Duration::from_millis(config.broker_timeout_ms),
            fallback_to_llm: config.fallback_to_llm,
        }
    }

    /// Replace the response builder (used by tests to force deterministic
    /// templates).
    pub fn with_response_builder(mut self, nlg: ResponseBuilder) -> Self {
        self.nlg = nlg;
        self
    }

    /// Decide one turn. Never fails: every internal error collapses into
    /// the degraded stock response with `route = "error"`.
    pub async fn decide(&self, snapshot: Snapshot) -> DecideResponse {
        let started = Instant::now();
        let deadline = started + self.total_timeout;
        self.transition(&snapshot, State::Received);

        let route = canary::route(&snapshot.conversation_id, &self.canary);
        self.transition(&snapshot, State::Routed);
        log::info!(
            "request {} conversation {} routed to {}",
            snapshot.request_id,
            snapshot.conversation_id,
            route
        );

        let mut response = match route {
            Route::SlmPipeline => match self.run_slm(&snapshot, deadline).await {
                Ok(response) => response,
                Err(e) => {
                    log::error!(
                        "request {} structured pipeline failed: {}",
                        snapshot.request_id,
                        e
                    );
                    self.degrade_or_fallback(&snapshot, deadline).await
                }
            },
            Route::Legacy => match self.run_legacy(&snapshot, deadline).await {
                Ok(response) => response,
                Err(e) => {
                    log::error!("request {} legacy path failed: {}", snapshot.request_id, e);
                    self.degraded(&snapshot)
                }
            },
        };

        response.telemetry.timings.total_ms = started.elapsed().as_millis() as u64;
        self.counters.record(&response.telemetry.route);
        self.transition(&snapshot, State::Returned);
        response
    }

    async fn run_slm(
        &self,
        snapshot: &Snapshot,
        deadline: Instant,
    ) -> Result<DecideResponse, PipelineError> {
        let manifest = self.manifest.current();
        let tools = manifest.tools_for(snapshot.vertical);

        // Extract.
        let budget = stage_budget(deadline).ok_or(PipelineError::DeadlineExceeded("extractor"))?;
        let timer = StageTimer::start();
        let extraction = match tokio::time::timeout(budget, self.extractor.extract(snapshot, tools))
            .await
        {
            Ok(result) => result.map_err(PipelineError::Extractor)?,
            Err(_) => return Err(PipelineError::Extractor(ExtractorError::Timeout)),
        };
        let extractor_ms = timer.finish(&snapshot.request_id, "extractor");
        self.transition(snapshot, State::Extracted);

        // Plan.
        let budget = stage_budget(deadline).ok_or(PipelineError::DeadlineExceeded("planner"))?;
        let timer = StageTimer::start();
        let plan = match tokio::time::timeout(
            budget,
            self.planner.plan(snapshot, &extraction, tools),
        )
        .await
        {
            Ok(result) => result.map_err(PipelineError::Planner)?,
            Err(_) => return Err(PipelineError::Planner(PlannerError::Timeout)),
        };
        let planner_ms = timer.finish(&snapshot.request_id, "planner");
        self.transition(snapshot, State::Planned);

        // Policy.
        let timer = StageTimer::start();
        let decision = self.policy.evaluate(&plan, &extraction, snapshot, tools);
        let policy_ms = timer.finish(&snapshot.request_id, "policy");
        self.transition(snapshot, State::PolicyEvaluated);

        // Execute.
        let timer = StageTimer::start();
        let observations = match &decision {
            Decision::Execute(calls) if !calls.is_empty() => {
                stage_budget(deadline).ok_or(PipelineError::DeadlineExceeded("broker"))?;
                let broker_deadline = deadline.min(Instant::now() + self.broker_timeout);
                self.broker
                    .execute(calls, tools, snapshot, broker_deadline)
                    .await
            }
            _ => Vec::new(),
        };
        let broker_ms = timer.finish(&snapshot.request_id, "broker");
        self.transition(snapshot, State::Executed);

        // Reduce.
        let timer = StageTimer::start();
        let mut patch = match &decision {
            Decision::Handoff { .. } | Decision::Deny { .. } => Patch::empty(),
            _ => reduce(&extraction.slots, &observations, tools),
        };
        match &decision {
            Decision::Handoff { .. } | Decision::Deny { .. } => {
                let offences = snapshot.internal_counter(GUARDRAIL_OFFENCES_SLOT);
                patch.set(
                    GUARDRAIL_OFFENCES_SLOT,
                    SlotValue::Num((offences + 1) as f64),
                );
            }
            Decision::Execute(_) if extraction.intent == Intent::Greeting => {
                patch.set("greeted", SlotValue::Bool(true));
            }
            _ => {}
        }
        let reducer_ms = timer.finish(&snapshot.request_id, "reducer");
        self.transition(snapshot, State::Reduced);

        // Compose.
        let budget = stage_budget(deadline).ok_or(PipelineError::DeadlineExceeded("nlg"))?;
        let timer = StageTimer::start();
        let mut merged = snapshot.merged_slots(&extraction.slots);
        for (key, value) in &patch.slots_set {
            if !key.starts_with('_') {
                merged.insert(key.clone(), value.clone());
            }
        }
        let nlg_input = NlgInput {
            intent: extraction.intent,
            slots: &merged,
            observations: &observations,
            decision: &decision,
            vertical: snapshot.vertical,
            locale: &snapshot.locale,
            business_name: &snapshot.business_name,
            requires_user_response: plan.requires_user_response,
        };
        let output = match tokio::time::timeout(budget, self.nlg.compose(nlg_input)).await {
            Ok(output) => output,
            Err(_) => return Err(PipelineError::DeadlineExceeded("nlg")),
        };
        let nlg_ms = timer.finish(&snapshot.request_id, "nlg");
        self.transition(snapshot, State::Composed);

        let tool_calls = emitted_calls(&decision, &observations, &manifest, snapshot);
        let policy_denied = matches!(decision, Decision::Deny { .. });

        let mut telemetry = Telemetry::new(Route::SlmPipeline.as_str());
        telemetry.timings.extractor_ms = extractor_ms;
        telemetry.timings.planner_ms = planner_ms;
        telemetry.timings.policy_ms = policy_ms;
        telemetry.timings.broker_ms = broker_ms;
        telemetry.timings.reducer_ms = reducer_ms;
        telemetry.timings.nlg_ms = nlg_ms;
        telemetry.intent = Some(extraction.intent.as_str().to_string());
        telemetry.confidence = Some(extraction.confidence);

        Ok(DecideResponse {
            assistant: AssistantReply {
                text: output.text,
                suggested_replies: output.quick_replies,
            },
            tool_calls,
            patch,
            telemetry,
            policy_denied,
        })
    }

    async fn run_legacy(
        &self,
        snapshot: &Snapshot,
        deadline: Instant,
    ) -> Result<DecideResponse, PipelineError> {
        let budget = stage_budget(deadline).ok_or(PipelineError::DeadlineExceeded("legacy"))?;
        let timer = StageTimer::start();
        let outcome = match tokio::time::timeout(budget, self.legacy.respond(snapshot)).await {
            Ok(result) => result.map_err(PipelineError::Legacy)?,
            Err(_) => return Err(PipelineError::Legacy(LegacyError::Timeout)),
        };
        timer.finish(&snapshot.request_id, "legacy");
        self.transition(snapshot, State::LegacyCalled);

        Ok(DecideResponse {
            assistant: AssistantReply {
                text: outcome.assistant_text,
                suggested_replies: None,
            },
            tool_calls: outcome.tool_calls,
            patch: outcome.patch,
            telemetry: Telemetry::new(Route::Legacy.as_str()),
            policy_denied: false,
        })
    }

    /// On structured-pipeline failure, optionally try the legacy shot
    /// before surrendering to the stock reply.
    async fn degrade_or_fallback(&self, snapshot: &Snapshot, deadline: Instant) -> DecideResponse {
        if self.fallback_to_llm && stage_budget(deadline).is_some() {
            match self.run_legacy(snapshot, deadline).await {
                Ok(response) => return response,
                Err(e) => {
                    log::error!(
                        "request {} legacy fallback also failed: {}",
                        snapshot.request_id,
                        e
                    );
                }
            }
        }
        self.degraded(snapshot)
    }

    /// The stock response: a short apology, no tool calls, empty patch.
    fn degraded(&self, snapshot: &Snapshot) -> DecideResponse {
        self.transition(snapshot, State::Degraded);
        DecideResponse {
            assistant: AssistantReply {
                text: nlg::stock_degraded_message(&snapshot.locale).to_string(),
                suggested_replies: None,
            },
            tool_calls: Vec::new(),
            patch: Patch::empty(),
            telemetry: Telemetry::new("error"),
            policy_denied: false,
        }
    }

    fn transition(&self, snapshot: &Snapshot, state: State) {
        log::debug!(
            target: "telemetry",
            "request={} state={}",
            snapshot.request_id,
            state.as_str()
        );
    }
}

/// Remaining budget before the deadline, or `None` when a stage must not
/// even start.
fn stage_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining <= DEADLINE_MARGIN {
        None
    } else {
        Some(remaining)
    }
}

/// The side-effecting calls the outer engine should see: writes that the
/// broker actually executed successfully. Read-only lookups are already
/// folded into observations and are not repeated.
fn emitted_calls(
    decision: &Decision,
    observations: &[crate::charla::snapshot::Observation],
    manifest: &crate::charla::manifest::Manifest,
    snapshot: &Snapshot,
) -> Vec<ToolCall> {
    let calls = match decision {
        Decision::Execute(calls) => calls,
        _ => return Vec::new(),
    };
    calls
        .iter()
        .zip(observations.iter())
        .filter(|(call, observation)| {
            observation.status == crate::charla::snapshot::ObservationStatus::Ok
                && manifest
                    .tool(snapshot.vertical, &call.tool)
                    .map(|spec| spec.is_write())
                    .unwrap_or(false)
        })
        .map(|(call, _)| call.clone())
        .collect()
}
