//! Per-request telemetry: stage timings, the response telemetry block,
//! and process-wide route counters.
//!
//! Spans are structured log records on the `telemetry` target so the
//! outer platform can scrape them without parsing prose; the same numbers
//! travel back to the caller inside every `DecideResponse`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Milliseconds spent in each pipeline stage. Stages that did not run
/// report zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimings {
    pub extractor_ms: u64,
    pub planner_ms: u64,
    pub policy_ms: u64,
    pub broker_ms: u64,
    pub reducer_ms: u64,
    pub nlg_ms: u64,
    pub total_ms: u64,
}

/// The telemetry block attached to every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    /// `slm_pipeline`, `legacy`, or `error`.
    pub route: String,
    #[serde(flatten)]
    pub timings: StageTimings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Telemetry {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            timings: StageTimings::default(),
            intent: None,
            confidence: None,
        }
    }
}

/// Small helper around `Instant` for timing one stage.
pub struct StageTimer {
    start: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the timer started.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and emit a span record for the stage.
    pub fn finish(self, request_id: &str, stage: &str) -> u64 {
        let ms = self.elapsed_ms();
        span(request_id, stage, ms);
        ms
    }
}

/// Emit one structured span record.
pub fn span(request_id: &str, stage: &str, ms: u64) {
    log::info!(target: "telemetry", "request={} stage={} ms={}", request_id, stage, ms);
}

/// Process-wide per-route request totals.
#[derive(Debug, Default)]
pub struct RouteCounters {
    slm: AtomicU64,
    legacy: AtomicU64,
    error: AtomicU64,
}

impl RouteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one finished request and log the running totals.
    pub fn record(&self, route: &str) {
        let counter = match route {
            "slm_pipeline" => &self.slm,
            "legacy" => &self.legacy,
            _ => &self.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        log::info!(
            target: "telemetry",
            "route_totals slm={} legacy={} error={}",
            self.slm.load(Ordering::Relaxed),
            self.legacy.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed)
        );
    }

    /// Current totals as (slm, legacy, error).
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.slm.load(Ordering::Relaxed),
            self.legacy.load(Ordering::Relaxed),
            self.error.load(Ordering::Relaxed),
        )
    }
}
