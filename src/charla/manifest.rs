//! Per-vertical tool manifest: which tools exist, their argument shapes,
//! slot preconditions, and operational policies (timeouts, retries,
//! circuit thresholds, idempotency).
//!
//! The manifest is loaded once at startup (built-in defaults, optionally
//! overridden by a JSON file) and is immutable for the duration of a
//! request. A [`ManifestStore`] holds the current `Arc<Manifest>` and can
//! swap it on SIGHUP without touching in-flight requests.
//!
//! # File format
//!
//! ```json
//! {
//!   "services": [
//!     {
//!       "name": "check_availability",
//!       "args": [
//!         {"name": "service_type", "type": "string", "required": true},
//!         {"name": "preferred_date", "type": "string", "required": true}
//!       ],
//!       "produces": ["available_slots"],
//!       "requires": ["service_type", "preferred_date"],
//!       "timeout_ms": 1200,
//!       "retries": {"max_attempts": 3, "base_backoff_ms": 100},
//!       "circuit": {"threshold": 5, "cooldown_ms": 30000},
//!       "idempotency": "request_id",
//!       "invalidates": []
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::charla::snapshot::Vertical;

/// Declared type of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// One declared tool argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    #[serde(default)]
    pub required: bool,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>, arg_type: ArgType) -> Self {
        Self {
            name: name.into(),
            arg_type,
            required: false,
        }
    }

    /// Mark the argument as required (builder pattern).
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Retry policy applied by the broker to one tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
        }
    }
}

/// Circuit-breaker thresholds for one tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitPolicy {
    /// Consecutive failures required to open the breaker.
    pub threshold: u32,
    /// Cooldown before the open breaker admits a half-open probe.
    pub cooldown_ms: u64,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// How the idempotency key for a tool call is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyScheme {
    /// Reuse the inbound request id; all retries of one user message share it.
    RequestId,
    /// Stable hash of the canonical argument object.
    ArgHash,
}

impl Default for IdempotencyScheme {
    fn default() -> Self {
        IdempotencyScheme::RequestId
    }
}

fn default_timeout_ms() -> u64 {
    1_000
}

/// Frozen descriptor for one tool within a vertical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// Slot names this tool can produce on success.
    #[serde(default)]
    pub produces: Vec<String>,
    /// Slot names that must be filled before this tool may run.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: RetryPolicy,
    #[serde(default)]
    pub circuit: CircuitPolicy,
    #[serde(default)]
    pub idempotency: IdempotencyScheme,
    /// Cache keys the outer layer should evict after a successful run.
    /// A non-empty list marks the tool as a write.
    #[serde(default)]
    pub invalidates: Vec<String>,
    /// Tools that must have run earlier in the same plan before this one.
    #[serde(default)]
    pub after: Vec<String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            produces: Vec::new(),
            requires: Vec::new(),
            timeout_ms: default_timeout_ms(),
            retries: RetryPolicy::default(),
            circuit: CircuitPolicy::default(),
            idempotency: IdempotencyScheme::default(),
            invalidates: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Append an argument declaration (builder pattern).
    pub fn with_arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    /// Declare the slots produced on success (builder pattern).
    pub fn with_produces(mut self, slots: &[&str]) -> Self {
        self.produces = slots.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declare slot preconditions (builder pattern).
    pub fn with_requires(mut self, slots: &[&str]) -> Self {
        self.requires = slots.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Override the per-attempt timeout (builder pattern).
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Override the retry policy (builder pattern).
    pub fn with_retries(mut self, retries: RetryPolicy) -> Self {
        self.retries = retries;
        self
    }

    /// Override the idempotency scheme (builder pattern).
    pub fn with_idempotency(mut self, scheme: IdempotencyScheme) -> Self {
        self.idempotency = scheme;
        self
    }

    /// Declare the cache keys invalidated by a successful run (builder pattern).
    pub fn with_invalidates(mut self, keys: &[&str]) -> Self {
        self.invalidates = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declare an explicit ordering dependency (builder pattern).
    pub fn with_after(mut self, tools: &[&str]) -> Self {
        self.after = tools.iter().map(|s| s.to_string()).collect();
        self
    }

    /// A tool is a write iff it invalidates external caches.
    pub fn is_write(&self) -> bool {
        !self.invalidates.is_empty()
    }

    /// Look up a declared argument by name.
    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.name == name)
    }

    /// Names of all required arguments.
    pub fn required_args(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name.as_str())
    }
}

/// Errors from loading a manifest file.
#[derive(Debug)]
pub enum ManifestError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestError::Io(e) => write!(f, "manifest read failed: {}", e),
            ManifestError::Parse(e) => write!(f, "manifest parse failed: {}", e),
        }
    }
}

impl std::error::Error for ManifestError {}

/// The full per-vertical tool catalogue, frozen at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(flatten)]
    verticals: HashMap<Vertical, Vec<ToolSpec>>,
}

impl Manifest {
    /// Empty manifest (only useful as a base for tests).
    pub fn empty() -> Self {
        Self {
            verticals: HashMap::new(),
        }
    }

    /// Compiled-in defaults for every vertical.
    ///
    /// The services catalogue is the richest (lookup, availability,
    /// booking lifecycle); other verticals get the subset that makes sense
    /// for their domain.
    pub fn builtin() -> Self {
        let catalog_lookup = ToolSpec::new("catalog_lookup")
            .with_arg(ArgSpec::new("service_type", ArgType::String))
            .with_produces(&["catalog", "price_range"])
            .with_timeout_ms(800);

        let business_hours = ToolSpec::new("business_hours")
            .with_produces(&["hours"])
            .with_timeout_ms(500)
            .with_idempotency(IdempotencyScheme::ArgHash);

        let check_availability = ToolSpec::new("check_availability")
            .with_arg(ArgSpec::new("service_type", ArgType::String).required())
            .with_arg(ArgSpec::new("preferred_date", ArgType::String).required())
            .with_arg(ArgSpec::new("preferred_time", ArgType::String))
            .with_produces(&["availability", "available_slots"])
            .with_requires(&["service_type", "preferred_date"])
            .with_timeout_ms(1_200);

        let create_booking = ToolSpec::new("create_booking")
            .with_arg(ArgSpec::new("service_type", ArgType::String).required())
            .with_arg(ArgSpec::new("preferred_date", ArgType::String).required())
            .with_arg(ArgSpec::new("preferred_time", ArgType::String).required())
            .with_arg(ArgSpec::new("client_name", ArgType::String).required())
            .with_arg(ArgSpec::new("client_email", ArgType::String).required())
            .with_produces(&["booking_id", "booking_status"])
            .with_requires(&[
                "service_type",
                "preferred_date",
                "preferred_time",
                "client_name",
                "client_email",
            ])
            .with_timeout_ms(2_000)
            .with_retries(RetryPolicy {
                max_attempts: 2,
                base_backoff_ms: 200,
            })
            .with_invalidates(&["availability"])
            .with_after(&["check_availability"]);

        let cancel_booking = ToolSpec::new("cancel_booking")
            .with_arg(ArgSpec::new("booking_id", ArgType::String).required())
            .with_produces(&["booking_status"])
            .with_requires(&["booking_id"])
            .with_timeout_ms(1_500)
            .with_invalidates(&["availability"]);

        let order_status = ToolSpec::new("order_status")
            .with_arg(ArgSpec::new("order_id", ArgType::String).required())
            .with_produces(&["order_status"])
            .with_requires(&["order_id"])
            .with_timeout_ms(800)
            .with_idempotency(IdempotencyScheme::ArgHash);

        let mut verticals = HashMap::new();
        verticals.insert(
            Vertical::Services,
            vec![
                catalog_lookup.clone(),
                business_hours.clone(),
                check_availability.clone(),
                create_booking.clone(),
                cancel_booking.clone(),
            ],
        );
        verticals.insert(
            Vertical::Gastronomy,
            vec![
                catalog_lookup.clone(),
                business_hours.clone(),
                check_availability.clone(),
                create_booking,
                cancel_booking,
            ],
        );
        verticals.insert(
            Vertical::RealEstate,
            vec![
                catalog_lookup.clone(),
                business_hours.clone(),
                check_availability,
            ],
        );
        verticals.insert(
            Vertical::ECommerce,
            vec![catalog_lookup.clone(), business_hours.clone(), order_status],
        );
        verticals.insert(Vertical::Generic, vec![catalog_lookup, business_hours]);

        Self { verticals }
    }

    /// Parse a manifest from its JSON document form.
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json).map_err(ManifestError::Parse)
    }

    /// Read and parse a manifest file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(ManifestError::Io)?;
        Self::from_json(&raw)
    }

    /// Tools available to the given vertical. Unknown verticals get an
    /// empty slice rather than an error; policy then denies every call.
    pub fn tools_for(&self, vertical: Vertical) -> &[ToolSpec] {
        self.verticals
            .get(&vertical)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Look up one tool within a vertical.
    pub fn tool(&self, vertical: Vertical, name: &str) -> Option<&ToolSpec> {
        self.tools_for(vertical).iter().find(|t| t.name == name)
    }

    /// Register or replace a vertical's tool list (used by tests and by
    /// operators assembling custom manifests in code).
    pub fn with_vertical(mut self, vertical: Vertical, tools: Vec<ToolSpec>) -> Self {
        self.verticals.insert(vertical, tools);
        self
    }
}

/// Shared handle to the current manifest.
///
/// Readers grab a cheap `Arc` clone per request; a SIGHUP reload swaps the
/// inner pointer without blocking in-flight requests.
pub struct ManifestStore {
    current: RwLock<Arc<Manifest>>,
}

impl ManifestStore {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            current: RwLock::new(Arc::new(manifest)),
        }
    }

    /// Snapshot of the manifest for the duration of one request.
    pub fn current(&self) -> Arc<Manifest> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the manifest atomically.
    pub fn replace(&self, manifest: Manifest) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(manifest);
    }
}

/// Reload the manifest from `path` every time the process receives SIGHUP.
///
/// A parse failure keeps the previous manifest and logs the error; the
/// operator can fix the file and signal again.
#[cfg(unix)]
pub fn spawn_sighup_reload(store: Arc<ManifestStore>, path: std::path::PathBuf) {
    tokio::spawn(async move {
        let mut hangups = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("cannot install SIGHUP handler: {}", e);
                return;
            }
        };
        while hangups.recv().await.is_some() {
            match Manifest::from_path(&path) {
                Ok(manifest) => {
                    store.replace(manifest);
                    log::info!("manifest reloaded from {}", path.display());
                }
                Err(e) => {
                    log::error!("manifest reload failed, keeping previous: {}", e);
                }
            }
        }
    });
}
