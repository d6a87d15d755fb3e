//! Response builder: turns the pipeline outcome into the user-facing
//! assistant text plus optional quick-reply suggestions.
//!
//! Deterministic templates cover every shape that maps cleanly onto a
//! known outcome (greeting, price quote, availability, confirmation,
//! clarification, handoff). The catalogue is keyed by
//! `(vertical, intent, outcome, language)` with a fallback chain down to
//! the generic vertical and English. Only when no template matches does
//! the builder fall back to an LLM call, with a hard length cap and a
//! system instruction that forbids invented facts.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::charla::extractor::Intent;
use crate::charla::llm::JsonModeClient;
use crate::charla::policy::Decision;
use crate::charla::snapshot::{Observation, ObservationStatus, SlotMap, Vertical};

/// Schema identifier for the LLM fallback.
pub const NLG_SCHEMA: &str = "nlg_v1";

type TemplateKey = (Vertical, Intent, &'static str, &'static str);

lazy_static! {
    static ref TEMPLATES: HashMap<TemplateKey, &'static str> = {
        use Intent::*;
        use Vertical::*;
        let mut t: HashMap<TemplateKey, &'static str> = HashMap::new();

        // Spanish catalogue.
        t.insert((Generic, Greeting, "ok", "es"),
            "¡Hola! Soy el asistente de {business_name}. ¿En qué te ayudo?");
        t.insert((Generic, InfoPrice, "ok", "es"),
            "Estos son nuestros precios: {catalog_summary}");
        t.insert((Generic, InfoHours, "ok", "es"),
            "Nuestro horario de atención: {hours}");
        t.insert((Services, Book, "ok", "es"),
            "¡Listo! Reservé {service_type} para el {preferred_date} a las {preferred_time} a nombre de {client_name}.");
        t.insert((Gastronomy, Book, "ok", "es"),
            "¡Confirmado! Mesa reservada para el {preferred_date} a las {preferred_time} a nombre de {client_name}.");
        t.insert((Generic, Cancel, "ok", "es"),
            "Tu reserva quedó cancelada.");
        t.insert((Generic, Reschedule, "ok", "es"),
            "¡Listo! Cambié tu reserva a {preferred_date} a las {preferred_time}.");
        t.insert((Generic, Other, "ok", "es"),
            "¿Me contás un poco más para poder ayudarte?");
        t.insert((Generic, Other, "ask", "es"),
            "Para avanzar necesito: {missing_slots}. ¿Me los pasás?");
        t.insert((Services, Book, "ask", "es"),
            "Para reservar necesito: {missing_slots}. ¿Me pasás esos datos?");
        t.insert((Generic, Other, "confirm", "es"),
            "¿Querés que avance con eso? Confirmame y lo hago.");
        t.insert((Generic, Other, "handoff", "es"),
            "Te paso con una persona del equipo para que te ayude mejor.");
        t.insert((Generic, Other, "deny", "es"),
            "No puedo ayudarte con ese pedido por este medio.");
        t.insert((Generic, Other, "tool_failed", "es"),
            "Tuve un problema consultando los datos. ¿Probamos de nuevo en un rato?");

        // English catalogue.
        t.insert((Generic, Greeting, "ok", "en"),
            "Hi! I'm the assistant for {business_name}. How can I help?");
        t.insert((Generic, InfoPrice, "ok", "en"),
            "Here are our prices: {catalog_summary}");
        t.insert((Generic, InfoHours, "ok", "en"),
            "Our opening hours: {hours}");
        t.insert((Services, Book, "ok", "en"),
            "Done! I booked {service_type} for {preferred_date} at {preferred_time} under {client_name}.");
        t.insert((Generic, Cancel, "ok", "en"),
            "Your booking has been cancelled.");
        t.insert((Generic, Other, "ok", "en"),
            "Could you tell me a bit more so I can help?");
        t.insert((Generic, Other, "ask", "en"),
            "To move forward I need: {missing_slots}. Could you share them?");
        t.insert((Generic, Other, "confirm", "en"),
            "Do you want me to go ahead with that? Just confirm and I will.");
        t.insert((Generic, Other, "handoff", "en"),
            "Let me hand you over to a member of the team.");
        t.insert((Generic, Other, "deny", "en"),
            "I can't help with that request through this channel.");
        t.insert((Generic, Other, "tool_failed", "en"),
            "I had trouble looking that up. Can we try again in a bit?");

        t
    };
}

/// Stock message emitted on pipeline degradation.
pub fn stock_degraded_message(locale: &str) -> &'static str {
    if language(locale) == "en" {
        "Sorry, I hit a glitch. Can you try again in a moment?"
    } else {
        "Uy, tuve un problema técnico. ¿Podés intentarlo de nuevo en un momento?"
    }
}

/// Everything the builder needs for one turn.
pub struct NlgInput<'a> {
    pub intent: Intent,
    /// Merged view: snapshot slots, extraction, and produced observation
    /// fields, reserved keys excluded.
    pub slots: &'a SlotMap,
    pub observations: &'a [Observation],
    pub decision: &'a Decision,
    pub vertical: Vertical,
    pub locale: &'a str,
    pub business_name: &'a str,
    /// Planner hint that the turn needs a substantive reply.
    pub requires_user_response: bool,
}

/// Assembled reply.
#[derive(Debug, Clone, PartialEq)]
pub struct NlgOutput {
    pub text: String,
    pub quick_replies: Option<Vec<String>>,
}

/// The response builder.
pub struct ResponseBuilder {
    client: Option<Arc<dyn JsonModeClient>>,
}

impl ResponseBuilder {
    /// Deterministic-only builder; template misses use the generic reply.
    pub fn new() -> Self {
        Self { client: None }
    }

    /// Enable the LLM fallback for shapes without a template (builder pattern).
    pub fn with_llm(mut self, client: Arc<dyn JsonModeClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Compose the assistant text and quick replies for this turn.
    pub async fn compose(&self, input: NlgInput<'_>) -> NlgOutput {
        let outcome = outcome_tag(input.decision, input.observations);
        let lang = language(input.locale);
        let placeholders = build_placeholders(&input);

        // A clean template wins unless the planner flagged a substantive
        // reply for an open-ended turn with real tool context behind it.
        let template = lookup_template(input.vertical, input.intent, outcome, lang);
        let open_ended = input.requires_user_response
            && input.intent == Intent::Other
            && outcome == "ok"
            && !input.observations.is_empty();
        let text = match template {
            Some(template) if !open_ended => fill(template, &placeholders),
            _ => self.llm_fallback(&input, outcome, lang, &placeholders).await,
        };

        let text = enforce_cap(text, cap_for(input.intent));
        NlgOutput {
            quick_replies: quick_replies(input.intent, outcome, lang),
            text,
        }
    }

    async fn llm_fallback(
        &self,
        input: &NlgInput<'_>,
        outcome: &'static str,
        lang: &'static str,
        placeholders: &HashMap<String, String>,
    ) -> String {
        let client = match &self.client {
            Some(client) => client,
            None => return generic_reply(outcome, lang, placeholders),
        };

        let system = format!(
            "You write one short WhatsApp reply for {business} ({vertical}), in the user's language ({locale}).\n\
             Reply with JSON only: {{\"text\": string}}.\n\
             Never invent facts, prices, or availability not present in the context.\n\
             Never give medical or legal advice. Never promise an unconfirmed booking.\n\
             Hard limit: {cap} characters.",
            business = input.business_name,
            vertical = input.vertical,
            locale = input.locale,
            cap = cap_for(input.intent),
        );
        let user = format!(
            "Intent: {}\nOutcome: {}\nKnown context: {}\nObservations: {}",
            input.intent,
            outcome,
            serde_json::to_string(input.slots).unwrap_or_else(|_| "{}".to_string()),
            serde_json::to_string(input.observations).unwrap_or_else(|_| "[]".to_string()),
        );

        match client.complete_json(NLG_SCHEMA, &system, &user).await {
            Ok(value) => match value.get("text").and_then(serde_json::Value::as_str) {
                Some(text) if !text.trim().is_empty() => text.to_string(),
                _ => {
                    log::warn!("nlg fallback reply missing `text`, using generic");
                    generic_reply(outcome, lang, placeholders)
                }
            },
            Err(e) => {
                log::warn!("nlg fallback failed ({}), using generic", e);
                generic_reply(outcome, lang, placeholders)
            }
        }
    }
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-letter language from a locale tag; everything non-English renders
/// the Spanish catalogue, which is the primary market.
fn language(locale: &str) -> &'static str {
    match locale.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("en") => "en",
        _ => "es",
    }
}

/// Map the decision and observation set onto a template outcome tag.
fn outcome_tag(decision: &Decision, observations: &[Observation]) -> &'static str {
    match decision {
        Decision::AskUser { missing_slots, .. } => {
            if missing_slots.is_empty() {
                "confirm"
            } else {
                "ask"
            }
        }
        Decision::Handoff { .. } => "handoff",
        Decision::Deny { .. } => "deny",
        Decision::Execute(_) => {
            if observations
                .iter()
                .any(|o| o.status != ObservationStatus::Ok)
            {
                "tool_failed"
            } else {
                "ok"
            }
        }
    }
}

/// Catalogue lookup with the fallback chain: exact vertical, generic
/// vertical, generic intent, then the same chain in English.
fn lookup_template(
    vertical: Vertical,
    intent: Intent,
    outcome: &'static str,
    lang: &'static str,
) -> Option<&'static str> {
    let chain = |lang: &'static str| -> Option<&'static str> {
        [
            (vertical, intent),
            (Vertical::Generic, intent),
            (Vertical::Generic, Intent::Other),
        ]
        .iter()
        .find_map(|&(v, i)| TEMPLATES.get(&(v, i, outcome, lang)).copied())
    };
    chain(lang).or_else(|| if lang != "en" { chain("en") } else { None })
}

/// Hard fallback when no template and no LLM are available.
fn generic_reply(
    outcome: &'static str,
    lang: &'static str,
    placeholders: &HashMap<String, String>,
) -> String {
    let template = TEMPLATES
        .get(&(Vertical::Generic, Intent::Other, outcome, lang))
        .or_else(|| TEMPLATES.get(&(Vertical::Generic, Intent::Other, "ok", lang)))
        .copied()
        .unwrap_or("¿Me contás un poco más para poder ayudarte?");
    fill(template, placeholders)
}

/// Length cap by context.
fn cap_for(intent: Intent) -> usize {
    match intent {
        Intent::Greeting => 80,
        Intent::InfoHours | Intent::InfoPrice => 200,
        _ => 400,
    }
}

fn enforce_cap(text: String, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text;
    }
    let mut truncated: String = text.chars().take(cap.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

/// Resolve `{name}` placeholders. Unknown placeholders are left verbatim
/// so a template typo is visible instead of silently vanishing.
fn fill(template: &str, placeholders: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in placeholders {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

fn build_placeholders(input: &NlgInput<'_>) -> HashMap<String, String> {
    let mut placeholders = HashMap::new();
    placeholders.insert(
        "business_name".to_string(),
        if input.business_name.is_empty() {
            "nuestro local".to_string()
        } else {
            input.business_name.to_string()
        },
    );

    for (key, value) in input.slots {
        placeholders.insert(key.clone(), value.display_string());
    }

    if let Some(summary) = catalog_summary(input.observations) {
        placeholders.insert("catalog_summary".to_string(), summary);
    }

    if let Decision::AskUser { missing_slots, .. } = input.decision {
        let lang = language(input.locale);
        let joined = missing_slots
            .iter()
            .map(|slot| humanize_slot(slot, lang))
            .collect::<Vec<_>>()
            .join(", ");
        placeholders.insert("missing_slots".to_string(), joined);
    }

    placeholders
}

/// Render the catalog-lookup result as a short price listing.
///
/// Understands `{"items": [{"name", "price_min", "price_max"}]}` and falls
/// back to a flat `price_range` field.
fn catalog_summary(observations: &[Observation]) -> Option<String> {
    let data = observations
        .iter()
        .rev()
        .find(|o| o.tool == "catalog_lookup" && o.status == ObservationStatus::Ok)?
        .data
        .as_ref()?;

    if let Some(items) = data.get("items").and_then(serde_json::Value::as_array) {
        let lines: Vec<String> = items
            .iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?;
                match (
                    item.get("price_min").and_then(serde_json::Value::as_f64),
                    item.get("price_max").and_then(serde_json::Value::as_f64),
                ) {
                    (Some(min), Some(max)) => {
                        Some(format!("{} ${:.0} a ${:.0}", name, min, max))
                    }
                    (Some(min), None) => Some(format!("{} ${:.0}", name, min)),
                    _ => Some(name.to_string()),
                }
            })
            .collect();
        if !lines.is_empty() {
            return Some(lines.join("; "));
        }
    }

    data.get("price_range")
        .and_then(serde_json::Value::as_str)
        .map(|range| range.to_string())
}

/// Human wording for a slot name in clarification questions.
fn humanize_slot(slot: &str, lang: &str) -> String {
    let es = match slot {
        "service_type" => Some("el servicio"),
        "preferred_date" => Some("la fecha"),
        "preferred_time" => Some("el horario"),
        "client_name" => Some("tu nombre"),
        "client_email" => Some("tu email"),
        "booking_id" => Some("el código de reserva"),
        "order_id" => Some("el número de pedido"),
        _ => None,
    };
    let en = match slot {
        "service_type" => Some("the service"),
        "preferred_date" => Some("the date"),
        "preferred_time" => Some("the time"),
        "client_name" => Some("your name"),
        "client_email" => Some("your email"),
        "booking_id" => Some("the booking code"),
        "order_id" => Some("the order number"),
        _ => None,
    };
    let known = if lang == "en" { en } else { es };
    known
        .map(|s| s.to_string())
        .unwrap_or_else(|| slot.replace('_', " "))
}

/// Canonical next-user-utterances for the current intent.
fn quick_replies(intent: Intent, outcome: &str, lang: &'static str) -> Option<Vec<String>> {
    if outcome != "ok" {
        return None;
    }
    let es: Option<&[&str]> = match intent {
        Intent::Greeting => Some(&["Ver precios", "Reservar", "Horarios"]),
        Intent::InfoPrice => Some(&["Reservar", "Ver horarios"]),
        Intent::InfoHours => Some(&["Reservar", "Ver precios"]),
        _ => None,
    };
    let en: Option<&[&str]> = match intent {
        Intent::Greeting => Some(&["See prices", "Book", "Opening hours"]),
        Intent::InfoPrice => Some(&["Book", "Opening hours"]),
        Intent::InfoHours => Some(&["Book", "See prices"]),
        _ => None,
    };
    let picked = if lang == "en" { en } else { es };
    picked.map(|replies| replies.iter().map(|r| r.to_string()).collect())
}
