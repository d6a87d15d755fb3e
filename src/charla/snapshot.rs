//! Per-request data model: the immutable [`Snapshot`], the tagged
//! [`SlotValue`] union used for conversation state, and the
//! [`Observation`] records produced by tool execution.
//!
//! A `Snapshot` is constructed once by the HTTP entrypoint and then handed
//! to every pipeline stage by shared reference. Nothing downstream mutates
//! it; all state changes flow out of the pipeline as a
//! [`Patch`](crate::charla::reducer::Patch).
//!
//! Reserved slots (names starting with `_`) carry internal counters and are
//! kept in a separate `internal` map so they never leak into prompts or
//! user-facing text.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maximum number of recent observations carried into a request.
pub const MAX_RECENT_OBSERVATIONS: usize = 5;

/// Maximum accepted length for the inbound user message, in characters.
pub const MAX_USER_TEXT_CHARS: usize = 4096;

/// Business-domain tag that selects a tool manifest and prompt set.
///
/// # Example
///
/// ```
/// use charla::charla::snapshot::Vertical;
///
/// let v: Vertical = serde_json::from_str("\"real-estate\"").unwrap();
/// assert_eq!(v, Vertical::RealEstate);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Vertical {
    Gastronomy,
    RealEstate,
    Services,
    ECommerce,
    Generic,
}

impl Vertical {
    /// Stable lowercase tag used in logs and template keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Vertical::Gastronomy => "gastronomy",
            Vertical::RealEstate => "real-estate",
            Vertical::Services => "services",
            Vertical::ECommerce => "e-commerce",
            Vertical::Generic => "generic",
        }
    }
}

impl std::fmt::Display for Vertical {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single conversation slot value.
///
/// Slots are intrinsically heterogeneous (a date string, a price, a list of
/// staff names), so they are modelled as a small tagged union rather than an
/// open JSON blob. The untagged serde representation keeps the wire shape
/// natural: `"Corte"`, `42.5`, `true`, `[..]`, `{..}`.
///
/// # Example
///
/// ```
/// use charla::charla::snapshot::SlotValue;
///
/// let v: SlotValue = serde_json::from_str("\"Coloración\"").unwrap();
/// assert_eq!(v.as_str(), Some("Coloración"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotValue {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<SlotValue>),
    Map(HashMap<String, SlotValue>),
}

impl SlotValue {
    /// Borrow the string content, if this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SlotValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric content, if this value is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SlotValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content, if this value is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SlotValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert an arbitrary JSON value into a slot value.
    ///
    /// Returns `None` for JSON `null`, which has no slot representation
    /// (absent slots are simply not present in the map).
    pub fn from_json(value: &serde_json::Value) -> Option<SlotValue> {
        match value {
            serde_json::Value::Null => None,
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    /// Render this value for prompt or template interpolation.
    pub fn display_string(&self) -> String {
        match self {
            SlotValue::Str(s) => s.clone(),
            SlotValue::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            SlotValue::Bool(b) => b.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

impl From<&str> for SlotValue {
    fn from(s: &str) -> Self {
        SlotValue::Str(s.to_string())
    }
}

impl From<String> for SlotValue {
    fn from(s: String) -> Self {
        SlotValue::Str(s)
    }
}

impl From<f64> for SlotValue {
    fn from(n: f64) -> Self {
        SlotValue::Num(n)
    }
}

impl From<bool> for SlotValue {
    fn from(b: bool) -> Self {
        SlotValue::Bool(b)
    }
}

/// String-keyed map of slot values, the unit of conversation state.
pub type SlotMap = HashMap<String, SlotValue>;

/// Outcome class of a single tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Ok,
    Failed,
    Timeout,
    CircuitOpen,
    Denied,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::Ok => "ok",
            ObservationStatus::Failed => "failed",
            ObservationStatus::Timeout => "timeout",
            ObservationStatus::CircuitOpen => "circuit_open",
            ObservationStatus::Denied => "denied",
        }
    }
}

/// Record of one tool call executed by the broker.
///
/// Observations are appended to the bounded recent-observations window and
/// folded into the state patch by the reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Tool name as declared in the manifest.
    pub tool: String,
    /// Outcome class.
    pub status: ObservationStatus,
    /// Observed latency of the concluding attempt, in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
    /// Parsed response body, present on `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error kind, present on failure statuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of attempts made. Zero when the call never left the process.
    #[serde(default)]
    pub attempts: u32,
}

impl Observation {
    /// Successful execution with a parsed body.
    pub fn ok(tool: impl Into<String>, data: serde_json::Value, latency_ms: u64, attempts: u32) -> Self {
        Self {
            tool: tool.into(),
            status: ObservationStatus::Ok,
            latency_ms,
            data: Some(data),
            error: None,
            attempts,
        }
    }

    /// Terminal failure with an error kind.
    pub fn failed(tool: impl Into<String>, error: impl Into<String>, latency_ms: u64, attempts: u32) -> Self {
        Self {
            tool: tool.into(),
            status: ObservationStatus::Failed,
            latency_ms,
            data: None,
            error: Some(error.into()),
            attempts,
        }
    }

    /// Deadline expiry, either per attempt or from the global budget.
    pub fn timeout(tool: impl Into<String>, latency_ms: u64, attempts: u32) -> Self {
        Self {
            tool: tool.into(),
            status: ObservationStatus::Timeout,
            latency_ms,
            data: None,
            error: Some("timeout".to_string()),
            attempts,
        }
    }

    /// Call skipped because the tool's circuit breaker is open.
    pub fn circuit_open(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ObservationStatus::CircuitOpen,
            latency_ms: 0,
            data: None,
            error: Some("circuit_open".to_string()),
            attempts: 0,
        }
    }

    /// Call refused before execution (e.g. missing manifest entry).
    pub fn denied(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ObservationStatus::Denied,
            latency_ms: 0,
            data: None,
            error: Some(error.into()),
            attempts: 0,
        }
    }
}

/// Errors raised while validating a snapshot at construction time.
#[derive(Debug, Clone)]
pub enum SnapshotError {
    /// A required identifier (workspace, conversation, request) is empty.
    MissingIdentifier(&'static str),
    /// The user message exceeds [`MAX_USER_TEXT_CHARS`].
    MessageTooLong(usize),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::MissingIdentifier(which) => {
                write!(f, "missing required identifier: {}", which)
            }
            SnapshotError::MessageTooLong(len) => write!(
                f,
                "user message is {} chars, limit is {}",
                len, MAX_USER_TEXT_CHARS
            ),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// The immutable per-request input bundle.
///
/// Built once per inbound message by the request adapter, validated, then
/// shared read-only with every stage. `slots` holds user-visible state;
/// `internal` holds reserved `_`-prefixed counters that must never reach a
/// prompt or a template.
///
/// # Example
///
/// ```
/// use charla::charla::snapshot::{Snapshot, Vertical};
///
/// let snap = Snapshot::new("ws-1", "whatsapp", "conv-1", "req-1", Vertical::Services)
///     .with_business_name("Peluquería Sol")
///     .with_user_text("hola");
/// assert!(snap.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Tenant identifier. Every outbound call carries it.
    pub workspace_id: String,
    /// Channel tag (e.g. `whatsapp`).
    pub channel: String,
    /// Stable conversation identifier, the canary routing key.
    pub conversation_id: String,
    /// Client-chosen request identifier, unique per inbound message.
    /// Doubles as the idempotency key for `request_id`-scoped tools.
    pub request_id: String,
    /// Active business vertical.
    pub vertical: Vertical,
    /// Display name of the business, used in greetings.
    pub business_name: String,
    /// BCP-47-ish locale of the end user (e.g. `es-AR`).
    pub locale: String,
    /// Raw user message text.
    pub user_text: String,
    /// Current FSM state from the outer engine, if any.
    pub fsm_state: Option<String>,
    /// User-visible conversation slots.
    pub slots: SlotMap,
    /// Reserved `_`-prefixed slots (internal counters).
    pub internal: SlotMap,
    /// Bounded window of the most recent tool observations.
    pub recent_observations: Vec<Observation>,
}

impl Snapshot {
    /// Create a snapshot with the required identifiers and defaults for the
    /// rest (`es` locale, empty message, empty slots).
    pub fn new(
        workspace_id: impl Into<String>,
        channel: impl Into<String>,
        conversation_id: impl Into<String>,
        request_id: impl Into<String>,
        vertical: Vertical,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            channel: channel.into(),
            conversation_id: conversation_id.into(),
            request_id: request_id.into(),
            vertical,
            business_name: String::new(),
            locale: "es".to_string(),
            user_text: String::new(),
            fsm_state: None,
            slots: SlotMap::new(),
            internal: SlotMap::new(),
            recent_observations: Vec::new(),
        }
    }

    /// Set the business display name (builder pattern).
    pub fn with_business_name(mut self, name: impl Into<String>) -> Self {
        self.business_name = name.into();
        self
    }

    /// Set the user locale (builder pattern).
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Set the user message text (builder pattern).
    pub fn with_user_text(mut self, text: impl Into<String>) -> Self {
        self.user_text = text.into();
        self
    }

    /// Set the FSM state carried over from the outer engine (builder pattern).
    pub fn with_fsm_state(mut self, state: Option<String>) -> Self {
        self.fsm_state = state;
        self
    }

    /// Install the slot state, splitting reserved `_`-prefixed keys into the
    /// internal map (builder pattern).
    pub fn with_slots(mut self, slots: SlotMap) -> Self {
        let (visible, internal) = split_reserved(slots);
        self.slots = visible;
        self.internal = internal;
        self
    }

    /// Install the recent-observations window, keeping only the newest
    /// [`MAX_RECENT_OBSERVATIONS`] entries (builder pattern).
    pub fn with_recent_observations(mut self, mut observations: Vec<Observation>) -> Self {
        if observations.len() > MAX_RECENT_OBSERVATIONS {
            observations.drain(..observations.len() - MAX_RECENT_OBSERVATIONS);
        }
        self.recent_observations = observations;
        self
    }

    /// Check the construction invariants: non-empty identifiers and a user
    /// message within the accepted length.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.workspace_id.trim().is_empty() {
            return Err(SnapshotError::MissingIdentifier("workspace_id"));
        }
        if self.conversation_id.trim().is_empty() {
            return Err(SnapshotError::MissingIdentifier("conversation_id"));
        }
        if self.request_id.trim().is_empty() {
            return Err(SnapshotError::MissingIdentifier("request_id"));
        }
        let chars = self.user_text.chars().count();
        if chars > MAX_USER_TEXT_CHARS {
            return Err(SnapshotError::MessageTooLong(chars));
        }
        Ok(())
    }

    /// User-visible slots merged with an extraction patch. Extraction wins
    /// on key collisions (it is newer information).
    pub fn merged_slots(&self, extracted: &SlotMap) -> SlotMap {
        let mut merged = self.slots.clone();
        for (k, v) in extracted {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Read an internal counter, defaulting to zero.
    pub fn internal_counter(&self, key: &str) -> u64 {
        self.internal
            .get(key)
            .and_then(SlotValue::as_f64)
            .map(|n| n.max(0.0) as u64)
            .unwrap_or(0)
    }
}

/// Split a raw slot map into (user-visible, reserved) halves by the `_`
/// name prefix.
pub fn split_reserved(slots: SlotMap) -> (SlotMap, SlotMap) {
    let mut visible = SlotMap::new();
    let mut internal = SlotMap::new();
    for (k, v) in slots {
        if k.starts_with('_') {
            internal.insert(k, v);
        } else {
            visible.insert(k, v);
        }
    }
    (visible, internal)
}
