//! Extractor stage: free-form user text plus current slots in, structured
//! `{intent, confidence, slots}` out.
//!
//! The stage runs the LLM in JSON mode against the frozen `extractor_v1`
//! shape with at most one repair pass, all inside a single configurable
//! deadline (default 300 ms). Empty input short-circuits to
//! `{other, 0.0, {}}` without touching the backend.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::charla::llm::{complete_with_repair, JsonModeClient, LlmError};
use crate::charla::manifest::ToolSpec;
use crate::charla::snapshot::{SlotMap, SlotValue, Snapshot};

/// Schema identifier passed to the inference backend.
pub const EXTRACTOR_SCHEMA: &str = "extractor_v1";

/// Default extractor budget, repair pass included.
pub const DEFAULT_EXTRACTOR_TIMEOUT_MS: u64 = 300;

/// Coarse classification of user purpose for a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    Greeting,
    InfoHours,
    InfoPrice,
    Book,
    Cancel,
    Reschedule,
    Other,
}

impl Intent {
    /// All recognised intents, in prompt order.
    pub const ALL: [Intent; 7] = [
        Intent::Greeting,
        Intent::InfoHours,
        Intent::InfoPrice,
        Intent::Book,
        Intent::Cancel,
        Intent::Reschedule,
        Intent::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::InfoHours => "info_hours",
            Intent::InfoPrice => "info_price",
            Intent::Book => "book",
            Intent::Cancel => "cancel",
            Intent::Reschedule => "reschedule",
            Intent::Other => "other",
        }
    }

    /// Parse the wire tag. Unknown tags are a schema violation, not `Other`.
    pub fn parse(tag: &str) -> Option<Intent> {
        match tag {
            "greeting" => Some(Intent::Greeting),
            "info_hours" => Some(Intent::InfoHours),
            "info_price" => Some(Intent::InfoPrice),
            "book" => Some(Intent::Book),
            "cancel" => Some(Intent::Cancel),
            "reschedule" => Some(Intent::Reschedule),
            "other" => Some(Intent::Other),
            _ => None,
        }
    }

    /// Intents that take real-world action and therefore need the
    /// confidence gate in policy.
    pub fn is_action(&self) -> bool {
        matches!(self, Intent::Book | Intent::Cancel | Intent::Reschedule)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output of the extractor stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub intent: Intent,
    /// Model-reported confidence, finite, clamped to `[0, 1]`.
    pub confidence: f64,
    /// Newly extracted slot values for this turn.
    pub slots: SlotMap,
}

impl Extraction {
    /// The no-signal extraction used for empty input.
    pub fn empty() -> Self {
        Self {
            intent: Intent::Other,
            confidence: 0.0,
            slots: SlotMap::new(),
        }
    }
}

/// Extractor stage errors.
#[derive(Debug, Clone)]
pub enum ExtractorError {
    LlmUnavailable(String),
    SchemaInvalid(String),
    Timeout,
}

impl std::fmt::Display for ExtractorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractorError::LlmUnavailable(msg) => write!(f, "extractor llm unavailable: {}", msg),
            ExtractorError::SchemaInvalid(msg) => write!(f, "extractor schema invalid: {}", msg),
            ExtractorError::Timeout => write!(f, "extractor timeout"),
        }
    }
}

impl std::error::Error for ExtractorError {}

impl From<LlmError> for ExtractorError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(msg) => ExtractorError::LlmUnavailable(msg),
            LlmError::Timeout => ExtractorError::Timeout,
            LlmError::SchemaInvalid(msg) => ExtractorError::SchemaInvalid(msg),
        }
    }
}

/// The extractor stage.
pub struct Extractor {
    client: Arc<dyn JsonModeClient>,
    timeout: Duration,
}

impl Extractor {
    pub fn new(client: Arc<dyn JsonModeClient>) -> Self {
        Self {
            client,
            timeout: Duration::from_millis(DEFAULT_EXTRACTOR_TIMEOUT_MS),
        }
    }

    /// Override the stage budget (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Turn the snapshot's user text into an [`Extraction`].
    ///
    /// `tools` is the active vertical's manifest slice; its declared slot
    /// names bound what the extractor may emit.
    pub async fn extract(
        &self,
        snapshot: &Snapshot,
        tools: &[ToolSpec],
    ) -> Result<Extraction, ExtractorError> {
        if snapshot.user_text.trim().is_empty() {
            return Ok(Extraction::empty());
        }

        let allowed_slots = declared_slots(tools);
        let system = build_system_prompt(snapshot, &allowed_slots);
        let user = build_user_prompt(snapshot);

        let result = tokio::time::timeout(
            self.timeout,
            complete_with_repair(
                self.client.as_ref(),
                EXTRACTOR_SCHEMA,
                &system,
                &user,
                |value| parse_extraction(value, &allowed_slots),
            ),
        )
        .await;

        match result {
            Ok(Ok(extraction)) => {
                log::debug!(
                    "extracted intent={} confidence={:.2} slots={}",
                    extraction.intent,
                    extraction.confidence,
                    extraction.slots.len()
                );
                Ok(extraction)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ExtractorError::Timeout),
        }
    }
}

/// Slot names a vertical's tools understand: everything that can be passed
/// as an argument or is demanded as a precondition.
pub fn declared_slots(tools: &[ToolSpec]) -> BTreeSet<String> {
    let mut slots = BTreeSet::new();
    for tool in tools {
        for arg in &tool.args {
            slots.insert(arg.name.clone());
        }
        for slot in &tool.requires {
            slots.insert(slot.clone());
        }
    }
    slots
}

fn build_system_prompt(snapshot: &Snapshot, allowed_slots: &BTreeSet<String>) -> String {
    let intents = Intent::ALL
        .iter()
        .map(|i| i.as_str())
        .collect::<Vec<_>>()
        .join(" | ");
    let slots = allowed_slots.iter().cloned().collect::<Vec<_>>().join(", ");

    format!(
        "You classify one WhatsApp message for a {vertical} business ({business}).\n\
         Reply with JSON only, shape: {{\"intent\": string, \"confidence\": number, \"slots\": object}}.\n\
         intent must be one of: {intents}.\n\
         confidence is your certainty in [0,1].\n\
         slots may only use these names: {slots}. Extract only values the user actually stated.\n\
         Examples:\n\
         \"hola!\" -> {{\"intent\": \"greeting\", \"confidence\": 0.98, \"slots\": {{}}}}\n\
         \"cuánto sale la coloración?\" -> {{\"intent\": \"info_price\", \"confidence\": 0.9, \"slots\": {{\"service_type\": \"Coloración\"}}}}\n\
         \"quiero reservar corte para mañana 15hs\" -> {{\"intent\": \"book\", \"confidence\": 0.92, \"slots\": {{\"service_type\": \"Corte\", \"preferred_date\": \"mañana\", \"preferred_time\": \"15:00\"}}}}",
        vertical = snapshot.vertical,
        business = snapshot.business_name,
        intents = intents,
        slots = slots,
    )
}

fn build_user_prompt(snapshot: &Snapshot) -> String {
    let current = serde_json::to_string(&snapshot.slots).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Current slots: {}\nUser message ({}): {}",
        current, snapshot.locale, snapshot.user_text
    )
}

/// Validate one raw reply against the `extractor_v1` shape.
fn parse_extraction(value: &Value, allowed_slots: &BTreeSet<String>) -> Result<Extraction, String> {
    let obj = value.as_object().ok_or("reply is not a JSON object")?;

    let intent_tag = obj
        .get("intent")
        .and_then(Value::as_str)
        .ok_or("missing string field `intent`")?;
    let intent =
        Intent::parse(intent_tag).ok_or_else(|| format!("unknown intent `{}`", intent_tag))?;

    let confidence = obj
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or("missing numeric field `confidence`")?;
    if !confidence.is_finite() {
        return Err("confidence is not finite".to_string());
    }
    let confidence = confidence.clamp(0.0, 1.0);

    let raw_slots = match obj.get("slots") {
        None => return Err("missing object field `slots`".to_string()),
        Some(Value::Object(map)) => map,
        Some(_) => return Err("`slots` is not an object".to_string()),
    };

    let mut slots = SlotMap::new();
    for (name, raw) in raw_slots {
        if name.starts_with('_') || !allowed_slots.contains(name) {
            log::debug!("dropping undeclared extracted slot '{}'", name);
            continue;
        }
        if let Some(slot_value) = SlotValue::from_json(raw) {
            slots.insert(name.clone(), slot_value);
        }
    }

    Ok(Extraction {
        intent,
        confidence,
        slots,
    })
}
