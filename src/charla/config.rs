//! Environment-driven runtime configuration.
//!
//! Every knob has a documented default, and an unparseable value falls
//! back to the default with a warning instead of refusing to boot. The
//! only hard startup requirement is a readable manifest when
//! `SLM_MANIFEST_PATH` is set.

use std::path::PathBuf;

use crate::charla::canary::CanaryConfig;

/// Default worker-pool size, matched to the LLM backend concurrency limit.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 32;

/// Runtime configuration for the orchestrator service.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// `ENABLE_SLM_PIPELINE`, default true.
    pub enable_slm_pipeline: bool,
    /// `SLM_CANARY_PERCENT`, 0 to 100, default 100.
    pub canary_percent: u8,
    /// `SLM_EXTRACTOR_MODEL`.
    pub extractor_model: String,
    /// `SLM_PLANNER_MODEL`.
    pub planner_model: String,
    /// `SLM_RESPONSE_MODEL`, used by NLG fallback and the legacy path.
    pub response_model: String,
    /// `SLM_CONFIDENCE_THRESHOLD`, default 0.7.
    pub confidence_threshold: f64,
    /// `SLM_EXTRACTOR_TIMEOUT_MS`, default 300.
    pub extractor_timeout_ms: u64,
    /// `SLM_PLANNER_TIMEOUT_MS`, default 300.
    pub planner_timeout_ms: u64,
    /// `SLM_BROKER_TIMEOUT_MS`, budget for the whole broker phase,
    /// default 5000.
    pub broker_timeout_ms: u64,
    /// `SLM_TOTAL_TIMEOUT_MS`, default 10000.
    pub total_timeout_ms: u64,
    /// `SLM_FALLBACK_TO_LLM`: on pipeline failure, try the legacy
    /// single-shot before giving up with the stock reply. Default true.
    pub fallback_to_llm: bool,
    /// `ORCHESTRATOR_MAX_REQUESTS`, worker-pool bound, default 32.
    pub max_concurrent_requests: usize,
    /// `ORCHESTRATOR_MAX_PARALLEL_TOOLS`, per-request fan-out bound,
    /// default 8.
    pub max_parallel_tools: usize,
    /// `SLM_MANIFEST_PATH`: optional manifest file overriding the
    /// built-in catalogue.
    pub manifest_path: Option<PathBuf>,
    /// `LLM_ENDPOINT`: JSON-mode completion endpoint.
    pub llm_endpoint: String,
    /// `TOOL_EXECUTE_ENDPOINT`: workflow-engine tool execution endpoint.
    pub tool_execute_endpoint: String,
    /// `ORCHESTRATOR_BIND`, default `127.0.0.1:8080`.
    pub bind_addr: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enable_slm_pipeline: true,
            canary_percent: 100,
            extractor_model: "slm-extractor".to_string(),
            planner_model: "slm-planner".to_string(),
            response_model: "slm-response".to_string(),
            confidence_threshold: 0.7,
            extractor_timeout_ms: 300,
            planner_timeout_ms: 300,
            broker_timeout_ms: 5_000,
            total_timeout_ms: 10_000,
            fallback_to_llm: true,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_parallel_tools: 8,
            manifest_path: None,
            llm_endpoint: "http://127.0.0.1:8091/v1/json".to_string(),
            tool_execute_endpoint: "http://127.0.0.1:8092/tools/execute".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enable_slm_pipeline: env_bool("ENABLE_SLM_PIPELINE", defaults.enable_slm_pipeline),
            canary_percent: env_u64("SLM_CANARY_PERCENT", u64::from(defaults.canary_percent))
                .min(100) as u8,
            extractor_model: env_string("SLM_EXTRACTOR_MODEL", &defaults.extractor_model),
            planner_model: env_string("SLM_PLANNER_MODEL", &defaults.planner_model),
            response_model: env_string("SLM_RESPONSE_MODEL", &defaults.response_model),
            confidence_threshold: env_f64(
                "SLM_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            )
            .clamp(0.0, 1.0),
            extractor_timeout_ms: env_u64(
                "SLM_EXTRACTOR_TIMEOUT_MS",
                defaults.extractor_timeout_ms,
            ),
            planner_timeout_ms: env_u64("SLM_PLANNER_TIMEOUT_MS", defaults.planner_timeout_ms),
            broker_timeout_ms: env_u64("SLM_BROKER_TIMEOUT_MS", defaults.broker_timeout_ms),
            total_timeout_ms: env_u64("SLM_TOTAL_TIMEOUT_MS", defaults.total_timeout_ms),
            fallback_to_llm: env_bool("SLM_FALLBACK_TO_LLM", defaults.fallback_to_llm),
            max_concurrent_requests: env_u64(
                "ORCHESTRATOR_MAX_REQUESTS",
                defaults.max_concurrent_requests as u64,
            )
            .max(1) as usize,
            max_parallel_tools: env_u64(
                "ORCHESTRATOR_MAX_PARALLEL_TOOLS",
                defaults.max_parallel_tools as u64,
            )
            .max(1) as usize,
            manifest_path: std::env::var("SLM_MANIFEST_PATH").ok().map(PathBuf::from),
            llm_endpoint: env_string("LLM_ENDPOINT", &defaults.llm_endpoint),
            tool_execute_endpoint: env_string(
                "TOOL_EXECUTE_ENDPOINT",
                &defaults.tool_execute_endpoint,
            ),
            bind_addr: env_string("ORCHESTRATOR_BIND", &defaults.bind_addr),
        }
    }

    /// Canary knobs as read atomically per request.
    pub fn canary(&self) -> CanaryConfig {
        CanaryConfig {
            enable_slm_pipeline: self.enable_slm_pipeline,
            canary_percent: self.canary_percent,
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => {
                log::warn!("{}={} is not a bool, using {}", name, other, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("{}={} is not an integer, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("{}={} is not a number, using {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
