//! Deterministic canary router between the structured pipeline and the
//! legacy single-shot fallback.
//!
//! Routing is a pure function of the conversation id and the runtime
//! config: the same conversation always lands on the same branch for a
//! given percentage, so A/B measurements are free of within-conversation
//! contamination. The bucket comes from FNV-1a over the id's UTF-8 bytes,
//! which is stable across restarts and implementation languages.

use serde::{Deserialize, Serialize};

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// The branch a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Structured Extractor → Planner → Policy → Broker → Reducer → NLG path.
    SlmPipeline,
    /// Single-shot JSON-mode fallback.
    Legacy,
}

impl Route {
    /// Tag used in telemetry records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::SlmPipeline => "slm_pipeline",
            Route::Legacy => "legacy",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime knobs for the canary split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Master switch. When false every request goes legacy.
    pub enable_slm_pipeline: bool,
    /// Share of conversations routed to the structured pipeline, 0 to 100.
    pub canary_percent: u8,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enable_slm_pipeline: true,
            canary_percent: 100,
        }
    }
}

/// Standard 64-bit FNV-1a over a byte slice.
///
/// # Example
///
/// ```
/// use charla::charla::canary::fnv1a_64;
///
/// // Published test vector for the empty input.
/// assert_eq!(fnv1a_64(b""), 0xcbf29ce484222325);
/// ```
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Pick the branch for a conversation under the given config.
///
/// `canary_percent = 0` (or a disabled switch) sends everything legacy;
/// `100` sends everything to the structured pipeline. Values above 100 are
/// treated as 100.
pub fn route(conversation_id: &str, config: &CanaryConfig) -> Route {
    if !config.enable_slm_pipeline || config.canary_percent == 0 {
        return Route::Legacy;
    }
    if config.canary_percent >= 100 {
        return Route::SlmPipeline;
    }
    let bucket = fnv1a_64(conversation_id.as_bytes()) % 100;
    if bucket < u64::from(config.canary_percent) {
        Route::SlmPipeline
    } else {
        Route::Legacy
    }
}
