//! Policy engine: makes the plan safe and executable, and acts as the
//! slot-filling gate that turns a turn into a clarification question when
//! required information is missing.
//!
//! Validation runs in a fixed order: manifest membership, argument shape,
//! slot preconditions, guardrails, deduplication, then the call cap. The
//! output is a [`Decision`], the single place where handoff and deny are
//! ever decided; downstream components only render it.

use std::collections::HashSet;

use crate::charla::extractor::Extraction;
use crate::charla::manifest::ToolSpec;
use crate::charla::planner::{Plan, ToolCall, MAX_TOOL_CALLS};
use crate::charla::snapshot::{Snapshot, Vertical};

/// Reserved slot tracking guardrail offences within a conversation.
pub const GUARDRAIL_OFFENCES_SLOT: &str = "_guardrail_offences";

/// Default confidence required to unlock action-taking intents.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Terminal outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run these validated calls via the broker, then proceed to NLG.
    Execute(Vec<ToolCall>),
    /// Skip execution; NLG composes a clarification question.
    AskUser {
        prompt_hint: String,
        missing_slots: Vec<String>,
    },
    /// Yield the conversation to a human operator.
    Handoff { reason: String },
    /// The plan violates policy; fall back to a safe stock reply.
    Deny { reason: String },
}

/// Per-vertical hard limits checked by the guardrail step.
struct Guardrail {
    /// Largest monetary amount any argument may carry.
    max_amount: f64,
    /// Inclusive booking-hours window (local business time).
    booking_hours: (u32, u32),
}

fn guardrail_for(vertical: Vertical) -> Guardrail {
    match vertical {
        Vertical::Gastronomy => Guardrail {
            max_amount: 200_000.0,
            booking_hours: (10, 23),
        },
        Vertical::Services => Guardrail {
            max_amount: 500_000.0,
            booking_hours: (8, 20),
        },
        _ => Guardrail {
            max_amount: 1_000_000.0,
            booking_hours: (0, 23),
        },
    }
}

/// The policy engine.
pub struct PolicyEngine {
    confidence_threshold: f64,
    max_tool_calls: usize,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_tool_calls: MAX_TOOL_CALLS,
        }
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the confidence gate (builder pattern).
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Override the tool-call cap (builder pattern).
    pub fn with_max_tool_calls(mut self, cap: usize) -> Self {
        self.max_tool_calls = cap;
        self
    }

    /// Evaluate a plan against the active manifest and the current state.
    pub fn evaluate(
        &self,
        plan: &Plan,
        extraction: &Extraction,
        snapshot: &Snapshot,
        tools: &[ToolSpec],
    ) -> Decision {
        let merged = snapshot.merged_slots(&extraction.slots);

        // 1 + 2: manifest membership and argument shape. Violating calls
        // are dropped, not fatal; the rest of the plan may still be useful.
        let mut surviving: Vec<(&ToolSpec, ToolCall)> = Vec::new();
        for call in &plan.tool_calls {
            let spec = match tools.iter().find(|t| t.name == call.tool) {
                Some(spec) => spec,
                None => {
                    log::warn!(
                        "policy_denied reason=unknown_tool tool={} conversation={}",
                        call.tool,
                        snapshot.conversation_id
                    );
                    continue;
                }
            };
            if let Err(reason) = check_args(spec, &call.args) {
                log::warn!(
                    "policy_denied reason=bad_args tool={} detail={} conversation={}",
                    call.tool,
                    reason,
                    snapshot.conversation_id
                );
                continue;
            }
            surviving.push((spec, call.clone()));
        }

        // 3: slot preconditions, honouring intra-plan production.
        let mut produced_so_far: HashSet<&str> = HashSet::new();
        let mut missing: Vec<String> = Vec::new();
        for (spec, _) in &surviving {
            for required in &spec.requires {
                let satisfied = merged.contains_key(required)
                    || produced_so_far.contains(required.as_str());
                if !satisfied && !missing.contains(required) {
                    missing.push(required.clone());
                }
            }
            for produced in &spec.produces {
                produced_so_far.insert(produced.as_str());
            }
        }
        if !missing.is_empty() {
            return Decision::AskUser {
                prompt_hint: "missing_slots".to_string(),
                missing_slots: missing,
            };
        }

        // Confidence gate: low-confidence action intents must not reach
        // side-effecting tools; ask the user to confirm instead.
        if extraction.intent.is_action()
            && extraction.confidence < self.confidence_threshold
            && surviving.iter().any(|(spec, _)| spec.is_write())
        {
            return Decision::AskUser {
                prompt_hint: "confirm_intent".to_string(),
                missing_slots: Vec::new(),
            };
        }

        // 4: guardrails. First offence hands off, repeats are denied.
        if let Some(reason) = self.check_guardrails(&surviving, snapshot) {
            let offences = snapshot.internal_counter(GUARDRAIL_OFFENCES_SLOT);
            log::warn!(
                "guardrail violation ({}) offence #{} conversation={}",
                reason,
                offences + 1,
                snapshot.conversation_id
            );
            return if offences == 0 {
                Decision::Handoff { reason }
            } else {
                Decision::Deny { reason }
            };
        }

        // 5: deduplication on the canonical (tool, sorted args) identity,
        // then the cap.
        let mut seen: HashSet<String> = HashSet::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        for (_, call) in surviving {
            if seen.insert(call.canonical_key()) {
                calls.push(call);
            }
        }
        if calls.len() > self.max_tool_calls {
            log::warn!(
                "plan capped from {} to {} calls conversation={}",
                calls.len(),
                self.max_tool_calls,
                snapshot.conversation_id
            );
            calls.truncate(self.max_tool_calls);
        }

        Decision::Execute(calls)
    }

    fn check_guardrails(
        &self,
        calls: &[(&ToolSpec, ToolCall)],
        snapshot: &Snapshot,
    ) -> Option<String> {
        let guardrail = guardrail_for(snapshot.vertical);
        for (spec, call) in calls {
            let args = call.args.as_object()?;
            if let Some(amount) = args.get("amount").and_then(serde_json::Value::as_f64) {
                if amount > guardrail.max_amount {
                    return Some(format!(
                        "amount {} exceeds limit {}",
                        amount, guardrail.max_amount
                    ));
                }
            }
            if spec.is_write() || spec.name == "check_availability" {
                if let Some(time) = args.get("preferred_time").and_then(serde_json::Value::as_str)
                {
                    if let Some(hour) = parse_hour(time) {
                        let (open, close) = guardrail.booking_hours;
                        if hour < open || hour > close {
                            return Some(format!(
                                "requested hour {} outside business window {}-{}",
                                hour, open, close
                            ));
                        }
                    }
                }
            }
        }
        None
    }
}

/// Check that the call's args are a subset of the declared ones and every
/// required arg is present.
///
/// A missing required arg that is also a declared slot precondition is not
/// a shape violation: the planner simply had nothing to fill it with, and
/// the precondition step turns that into a clarification question instead
/// of silently dropping the call.
fn check_args(spec: &ToolSpec, args: &serde_json::Value) -> Result<(), String> {
    let obj = args
        .as_object()
        .ok_or_else(|| "args is not an object".to_string())?;

    for key in obj.keys() {
        if spec.arg(key).is_none() {
            return Err(format!("undeclared arg `{}`", key));
        }
    }
    for required in spec.required_args() {
        if !obj.contains_key(required) && !spec.requires.iter().any(|slot| slot == required) {
            return Err(format!("missing required arg `{}`", required));
        }
    }
    Ok(())
}

/// Extract the hour from `"HH:MM"` or `"HH"` strings. Returns `None` for
/// fuzzy values like `"mañana"` that the tools resolve themselves.
fn parse_hour(time: &str) -> Option<u32> {
    let head = time.split(':').next()?.trim();
    let hour: u32 = head.parse().ok()?;
    if hour < 24 {
        Some(hour)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charla::extractor::Intent;
    use crate::charla::manifest::{ArgSpec, ArgType, Manifest};
    use crate::charla::snapshot::{SlotMap, SlotValue};
    use serde_json::json;

    fn tools() -> Vec<ToolSpec> {
        Manifest::builtin().tools_for(Vertical::Services).to_vec()
    }

    fn snapshot() -> Snapshot {
        Snapshot::new("w", "whatsapp", "c", "r", Vertical::Services)
    }

    fn extraction(intent: Intent, confidence: f64, slots: &[(&str, &str)]) -> Extraction {
        let mut map = SlotMap::new();
        for (k, v) in slots {
            map.insert(k.to_string(), SlotValue::from(*v));
        }
        Extraction {
            intent,
            confidence,
            slots: map,
        }
    }

    fn plan(calls: Vec<ToolCall>) -> Plan {
        Plan {
            tool_calls: calls,
            requires_user_response: false,
        }
    }

    #[test]
    fn unknown_tool_is_dropped_not_fatal() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![
                ToolCall::new("time_machine", json!({})),
                ToolCall::new("catalog_lookup", json!({})),
            ]),
            &extraction(Intent::InfoPrice, 0.9, &[]),
            &snapshot(),
            &tools(),
        );
        match decision {
            Decision::Execute(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].tool, "catalog_lookup");
            }
            other => panic!("expected execute, got {:?}", other),
        }
    }

    #[test]
    fn undeclared_args_drop_the_call() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![ToolCall::new(
                "catalog_lookup",
                json!({"sort_by": "price"}),
            )]),
            &extraction(Intent::Other, 0.9, &[]),
            &snapshot(),
            &tools(),
        );
        assert_eq!(decision, Decision::Execute(vec![]));
    }

    #[test]
    fn missing_required_arg_without_slot_backing_drops_the_call() {
        // A required arg that is not a slot precondition cannot be asked
        // for; the call is simply invalid.
        let notifier = ToolSpec::new("notify_staff")
            .with_arg(ArgSpec::new("message", ArgType::String).required());
        let mut custom = tools();
        custom.push(notifier);

        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![ToolCall::new("notify_staff", json!({}))]),
            &extraction(Intent::Other, 0.9, &[]),
            &snapshot(),
            &custom,
        );
        assert_eq!(decision, Decision::Execute(vec![]));
    }

    #[test]
    fn unfillable_required_args_become_a_clarification() {
        // booking_id is both a required arg and a slot precondition, so an
        // empty call asks the user instead of being dropped.
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![ToolCall::new("cancel_booking", json!({}))]),
            &extraction(Intent::Cancel, 0.9, &[]),
            &snapshot(),
            &tools(),
        );
        assert!(matches!(
            decision,
            Decision::AskUser { ref missing_slots, .. }
                if missing_slots.contains(&"booking_id".to_string())
        ));
    }

    #[test]
    fn missing_preconditions_ask_the_user() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![ToolCall::new(
                "check_availability",
                json!({"service_type": "Corte", "preferred_date": "2026-08-02"}),
            )]),
            &extraction(Intent::Book, 0.9, &[]),
            &snapshot(),
            &tools(),
        );
        match decision {
            Decision::AskUser { missing_slots, .. } => {
                assert!(missing_slots.contains(&"service_type".to_string()));
                assert!(missing_slots.contains(&"preferred_date".to_string()));
            }
            other => panic!("expected ask_user, got {:?}", other),
        }
    }

    #[test]
    fn extraction_slots_satisfy_preconditions() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![ToolCall::new(
                "check_availability",
                json!({"service_type": "Corte", "preferred_date": "2026-08-02"}),
            )]),
            &extraction(
                Intent::Book,
                0.9,
                &[("service_type", "Corte"), ("preferred_date", "2026-08-02")],
            ),
            &snapshot(),
            &tools(),
        );
        assert!(matches!(decision, Decision::Execute(calls) if calls.len() == 1));
    }

    #[test]
    fn intra_plan_production_keeps_dependent_calls() {
        // cancel_booking requires booking_id; a custom earlier tool that
        // produces it keeps the dependency intra-plan.
        let finder = ToolSpec::new("find_booking")
            .with_produces(&["booking_id"]);
        let mut custom = tools();
        custom.push(finder);

        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![
                ToolCall::new("find_booking", json!({})),
                ToolCall::new("cancel_booking", json!({"booking_id": "$prev.booking_id"})),
            ]),
            &extraction(Intent::Cancel, 0.9, &[]),
            &snapshot(),
            &custom,
        );
        assert!(matches!(decision, Decision::Execute(calls) if calls.len() == 2));
    }

    #[test]
    fn duplicate_calls_collapse() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![
                ToolCall::new("catalog_lookup", json!({"service_type": "Corte"})),
                ToolCall::new("catalog_lookup", json!({"service_type": "Corte"})),
            ]),
            &extraction(Intent::InfoPrice, 0.9, &[]),
            &snapshot(),
            &tools(),
        );
        assert!(matches!(decision, Decision::Execute(calls) if calls.len() == 1));
    }

    #[test]
    fn plan_over_cap_drops_the_tail() {
        let engine = PolicyEngine::new();
        let calls: Vec<ToolCall> = (0..4)
            .map(|i| ToolCall::new("catalog_lookup", json!({ "service_type": format!("s{}", i) })))
            .collect();
        let decision = engine.evaluate(
            &plan(calls),
            &extraction(Intent::InfoPrice, 0.9, &[]),
            &snapshot(),
            &tools(),
        );
        match decision {
            Decision::Execute(kept) => {
                assert_eq!(kept.len(), 3);
                assert_eq!(kept[2].args["service_type"], "s2");
            }
            other => panic!("expected execute, got {:?}", other),
        }
    }

    #[test]
    fn low_confidence_action_asks_for_confirmation() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(
            &plan(vec![ToolCall::new(
                "create_booking",
                json!({
                    "service_type": "Corte",
                    "preferred_date": "2026-08-02",
                    "preferred_time": "15:00",
                    "client_name": "Juan",
                    "client_email": "juan@x.com"
                }),
            )]),
            &extraction(
                Intent::Book,
                0.4,
                &[
                    ("service_type", "Corte"),
                    ("preferred_date", "2026-08-02"),
                    ("preferred_time", "15:00"),
                    ("client_name", "Juan"),
                    ("client_email", "juan@x.com"),
                ],
            ),
            &snapshot(),
            &tools(),
        );
        assert!(matches!(
            decision,
            Decision::AskUser { ref prompt_hint, .. } if prompt_hint == "confirm_intent"
        ));
    }

    #[test]
    fn guardrail_first_offence_hands_off_then_denies() {
        let engine = PolicyEngine::new();
        let booking_at_3am = plan(vec![ToolCall::new(
            "create_booking",
            json!({
                "service_type": "Corte",
                "preferred_date": "2026-08-02",
                "preferred_time": "03:00",
                "client_name": "Juan",
                "client_email": "juan@x.com"
            }),
        )]);
        let ext = extraction(
            Intent::Book,
            0.95,
            &[
                ("service_type", "Corte"),
                ("preferred_date", "2026-08-02"),
                ("preferred_time", "03:00"),
                ("client_name", "Juan"),
                ("client_email", "juan@x.com"),
            ],
        );

        let first = engine.evaluate(&booking_at_3am, &ext, &snapshot(), &tools());
        assert!(matches!(first, Decision::Handoff { .. }));

        let mut slots = SlotMap::new();
        slots.insert(GUARDRAIL_OFFENCES_SLOT.to_string(), SlotValue::Num(1.0));
        let repeat_snapshot = snapshot().with_slots(slots);
        let second = engine.evaluate(&booking_at_3am, &ext, &repeat_snapshot, &tools());
        assert!(matches!(second, Decision::Deny { .. }));
    }

    #[test]
    fn fuzzy_times_pass_the_hour_guardrail() {
        assert_eq!(parse_hour("mañana"), None);
        assert_eq!(parse_hour("15:00"), Some(15));
        assert_eq!(parse_hour("8"), Some(8));
        assert_eq!(parse_hour("99:00"), None);
    }
}
