//! End-to-end pipeline scenarios with scripted LLM and transport doubles.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use charla::charla::config::OrchestratorConfig;
use charla::charla::extractor::EXTRACTOR_SCHEMA;
use charla::charla::legacy::LEGACY_SCHEMA;
use charla::charla::manifest::{Manifest, ManifestStore, RetryPolicy};
use charla::charla::pipeline::{Pipeline, StageClients};
use charla::charla::planner::PLANNER_SCHEMA;
use charla::charla::snapshot::{SlotValue, Snapshot, Vertical};

use common::{Behavior, MockLlm, MockTransport};

fn snapshot(text: &str) -> Snapshot {
    Snapshot::new(
        "8f1f9e1e-9f43-4e9f-9a06-5a9a1d1d8f50",
        "whatsapp",
        "conv-1",
        "req-1",
        Vertical::Services,
    )
    .with_business_name("Peluquería Sol")
    .with_locale("es-AR")
    .with_user_text(text)
}

fn pipeline(llm: Arc<MockLlm>, transport: Arc<MockTransport>) -> Pipeline {
    let config = OrchestratorConfig {
        // Generous stage budgets keep the suite robust on slow CI boxes.
        extractor_timeout_ms: 2_000,
        planner_timeout_ms: 2_000,
        fallback_to_llm: false,
        ..OrchestratorConfig::default()
    };
    let store = Arc::new(ManifestStore::new(Manifest::builtin()));
    Pipeline::new(&config, StageClients::shared(llm), transport, store)
}

fn extraction(intent: &str, confidence: f64, slots: serde_json::Value) -> serde_json::Value {
    json!({"intent": intent, "confidence": confidence, "slots": slots})
}

#[tokio::test]
async fn scenario_greeting() {
    let llm = Arc::new(MockLlm::new().reply(EXTRACTOR_SCHEMA, extraction("greeting", 0.97, json!({}))));
    let transport = Arc::new(MockTransport::new());
    let pipeline = pipeline(llm.clone(), transport);

    let response = pipeline.decide(snapshot("hola")).await;

    assert_eq!(response.telemetry.route, "slm_pipeline");
    assert_eq!(response.telemetry.intent.as_deref(), Some("greeting"));
    assert!(response.telemetry.confidence.unwrap() >= 0.9);
    assert!(response.tool_calls.is_empty());
    assert!(response.assistant.text.chars().count() <= 80);
    assert!(response.assistant.text.contains("Peluquería Sol"));
    assert_eq!(
        response.patch.slots_set.get("greeted").and_then(SlotValue::as_bool),
        Some(true)
    );
    // Greeting needs neither the planner nor any tool.
    assert_eq!(llm.calls_for(PLANNER_SCHEMA), 0);
}

#[tokio::test]
async fn scenario_generic_price_query() {
    let llm = Arc::new(
        MockLlm::new()
            .reply(EXTRACTOR_SCHEMA, extraction("info_price", 0.9, json!({})))
            .reply(
                PLANNER_SCHEMA,
                json!({
                    "tool_calls": [{"tool": "catalog_lookup", "args": {}}],
                    "requires_user_response": true
                }),
            ),
    );
    let transport = Arc::new(MockTransport::new().behave(
        "catalog_lookup",
        Behavior::Ok(json!({
            "items": [
                {"name": "Corte", "price_min": 3000, "price_max": 4500},
                {"name": "Coloración", "price_min": 8000, "price_max": 12000}
            ],
            "price_range": "3000-12000"
        })),
    ));
    let pipeline = pipeline(llm, transport.clone());

    let response = pipeline.decide(snapshot("cuánto sale?")).await;

    assert_eq!(response.telemetry.intent.as_deref(), Some("info_price"));
    // One read-only call executed, none re-emitted.
    assert_eq!(transport.invocations_of("catalog_lookup").len(), 1);
    assert!(transport.invocations_of("catalog_lookup")[0].args.as_object().unwrap().is_empty());
    assert!(response.tool_calls.is_empty());
    assert!(response.assistant.text.contains("Corte"));
    assert!(response.assistant.text.contains("3000"));
    assert_eq!(
        response.patch.slots_set.get("price_range").and_then(SlotValue::as_str),
        Some("3000-12000")
    );
}

#[tokio::test]
async fn scenario_specific_price_query() {
    let llm = Arc::new(
        MockLlm::new()
            .reply(
                EXTRACTOR_SCHEMA,
                extraction("info_price", 0.9, json!({"service_type": "Coloración"})),
            )
            .reply(
                PLANNER_SCHEMA,
                json!({
                    "tool_calls": [
                        {"tool": "catalog_lookup", "args": {"service_type": "Coloración"}}
                    ],
                    "requires_user_response": true
                }),
            ),
    );
    let transport = Arc::new(MockTransport::new().behave(
        "catalog_lookup",
        Behavior::Ok(json!({
            "items": [{"name": "Coloración", "price_min": 8000, "price_max": 12000}]
        })),
    ));
    let pipeline = pipeline(llm, transport.clone());

    let response = pipeline.decide(snapshot("cuánto sale la coloración?")).await;

    let lookup = &transport.invocations_of("catalog_lookup")[0];
    assert_eq!(lookup.args["service_type"], "Coloración");
    assert!(response.assistant.text.contains("Coloración"));
    assert!(!response.assistant.text.contains("Corte"));
    assert_eq!(
        response.patch.slots_set.get("service_type").and_then(SlotValue::as_str),
        Some("Coloración")
    );
}

#[tokio::test]
async fn scenario_booking_with_missing_slots() {
    let llm = Arc::new(
        MockLlm::new()
            .reply(EXTRACTOR_SCHEMA, extraction("book", 0.9, json!({})))
            .reply(
                PLANNER_SCHEMA,
                json!({
                    "tool_calls": [
                        {"tool": "check_availability", "args": {}},
                        {"tool": "create_booking", "args": {}}
                    ],
                    "requires_user_response": true
                }),
            ),
    );
    let transport = Arc::new(MockTransport::new());
    let pipeline = pipeline(llm, transport.clone());

    let response = pipeline.decide(snapshot("quiero reservar")).await;

    assert!(response.tool_calls.is_empty());
    assert!(transport.invocations.lock().unwrap().is_empty());
    // The clarification names the missing fields.
    assert!(response.assistant.text.contains("el servicio"));
    assert!(response.assistant.text.contains("la fecha"));
}

fn booking_llm() -> MockLlm {
    MockLlm::new()
        .reply(
            EXTRACTOR_SCHEMA,
            extraction(
                "book",
                0.92,
                json!({
                    "service_type": "Corte",
                    "preferred_date": "2026-08-02",
                    "preferred_time": "15:00",
                    "client_name": "Juan",
                    "client_email": "juan@x.com"
                }),
            ),
        )
        .reply(
            PLANNER_SCHEMA,
            json!({
                "tool_calls": [
                    {"tool": "check_availability", "args": {
                        "service_type": "Corte", "preferred_date": "2026-08-02",
                        "preferred_time": "15:00"
                    }},
                    {"tool": "create_booking", "args": {
                        "service_type": "Corte", "preferred_date": "2026-08-02",
                        "preferred_time": "15:00", "client_name": "Juan",
                        "client_email": "juan@x.com"
                    }}
                ],
                "requires_user_response": true
            }),
        )
}

#[tokio::test]
async fn scenario_booking_complete() {
    let llm = Arc::new(booking_llm());
    let transport = Arc::new(
        MockTransport::new()
            .behave(
                "check_availability",
                Behavior::Ok(json!({"availability": "free", "available_slots": ["15:00"]})),
            )
            .behave(
                "create_booking",
                Behavior::Ok(json!({"booking_id": "bk-1", "booking_status": "confirmed"})),
            ),
    );
    let pipeline = pipeline(llm, transport.clone());

    let response = pipeline
        .decide(snapshot("reservá corte mañana 15hs a nombre de Juan, juan@x.com"))
        .await;

    // Availability ran before the booking write.
    let invocations = transport.invocations.lock().unwrap();
    assert_eq!(invocations[0].tool, "check_availability");
    assert_eq!(invocations[1].tool, "create_booking");
    drop(invocations);

    // Only the write is re-emitted for the outer engine.
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].tool, "create_booking");

    assert_eq!(
        response.patch.slots_set.get("booking_id").and_then(SlotValue::as_str),
        Some("bk-1")
    );
    assert_eq!(
        response.patch.slots_set.get("client_email").and_then(SlotValue::as_str),
        Some("juan@x.com")
    );
    assert_eq!(
        response.patch.cache_invalidation_keys,
        vec!["availability".to_string()]
    );

    assert!(response.assistant.text.contains("Corte"));
    assert!(response.assistant.text.contains("2026-08-02"));
    assert!(response.assistant.text.contains("15:00"));

    // Budget property: the whole turn stayed within the configured limit.
    assert!(response.telemetry.timings.total_ms <= 10_050);
}

#[tokio::test]
async fn scenario_tool_timeout_then_retry_success() {
    // Shrink the availability timeout so the first hung attempt expires
    // quickly.
    let mut tools = Manifest::builtin().tools_for(Vertical::Services).to_vec();
    for tool in &mut tools {
        if tool.name == "check_availability" {
            tool.timeout_ms = 80;
            tool.retries = RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 5,
            };
        }
    }
    let manifest = Manifest::builtin().with_vertical(Vertical::Services, tools);

    let llm = Arc::new(booking_llm());
    let transport = Arc::new(
        MockTransport::new()
            .behave("check_availability", Behavior::Hang(Duration::from_millis(300)))
            .behave(
                "check_availability",
                Behavior::Ok(json!({"availability": "free", "available_slots": ["15:00"]})),
            )
            .behave(
                "create_booking",
                Behavior::Ok(json!({"booking_id": "bk-1", "booking_status": "confirmed"})),
            ),
    );

    let config = OrchestratorConfig {
        extractor_timeout_ms: 2_000,
        planner_timeout_ms: 2_000,
        fallback_to_llm: false,
        ..OrchestratorConfig::default()
    };
    let store = Arc::new(ManifestStore::new(manifest));
    let pipeline = Pipeline::new(&config, StageClients::shared(llm), transport.clone(), store);

    let response = pipeline
        .decide(snapshot("reservá corte mañana 15hs a nombre de Juan, juan@x.com"))
        .await;

    // Two attempts on the availability check, then the booking proceeded.
    assert_eq!(transport.invocations_of("check_availability").len(), 2);
    assert_eq!(transport.invocations_of("create_booking").len(), 1);
    assert!(response.assistant.text.contains("Corte"));
    assert!(response.assistant.text.contains("15:00"));
    assert_eq!(response.tool_calls.len(), 1);
}

#[tokio::test]
async fn empty_text_produces_no_tool_calls_and_no_extractor_llm_call() {
    let llm = Arc::new(MockLlm::new().reply(
        PLANNER_SCHEMA,
        json!({"tool_calls": [], "requires_user_response": true}),
    ));
    let transport = Arc::new(MockTransport::new());
    let pipeline = pipeline(llm.clone(), transport);

    let response = pipeline.decide(snapshot("")).await;

    assert_eq!(response.telemetry.intent.as_deref(), Some("other"));
    assert!(response.tool_calls.is_empty());
    assert_eq!(llm.calls_for(EXTRACTOR_SCHEMA), 0);
}

#[tokio::test]
async fn canary_zero_routes_to_legacy() {
    let llm = Arc::new(MockLlm::new().reply(
        LEGACY_SCHEMA,
        json!({
            "assistant_text": "¡Hola! ¿En qué te ayudo?",
            "tool_calls": [],
            "patch": {"slots": {"greeted": true}}
        }),
    ));
    let transport = Arc::new(MockTransport::new());

    let config = OrchestratorConfig {
        canary_percent: 0,
        ..OrchestratorConfig::default()
    };
    let store = Arc::new(ManifestStore::new(Manifest::builtin()));
    let pipeline = Pipeline::new(&config, StageClients::shared(llm.clone()), transport, store);

    let response = pipeline.decide(snapshot("hola")).await;

    assert_eq!(response.telemetry.route, "legacy");
    assert_eq!(response.assistant.text, "¡Hola! ¿En qué te ayudo?");
    assert_eq!(llm.calls_for(EXTRACTOR_SCHEMA), 0);
    assert_eq!(llm.calls_for(LEGACY_SCHEMA), 1);
    assert_eq!(
        response.patch.slots_set.get("greeted").and_then(SlotValue::as_bool),
        Some(true)
    );
}

#[tokio::test]
async fn extractor_outage_degrades_to_the_stock_reply() {
    // No scripted replies at all: the extractor call fails immediately.
    let llm = Arc::new(MockLlm::new());
    let transport = Arc::new(MockTransport::new());
    let pipeline = pipeline(llm, transport);

    let response = pipeline.decide(snapshot("hola")).await;

    assert_eq!(response.telemetry.route, "error");
    assert!(response.tool_calls.is_empty());
    assert_eq!(response.patch.slots_set.len(), 0);
    assert!(response.assistant.text.contains("problema"));
}

#[tokio::test]
async fn pipeline_failure_falls_back_to_legacy_when_enabled() {
    // Extractor has no script (fails); legacy does.
    let llm = Arc::new(MockLlm::new().reply(
        LEGACY_SCHEMA,
        json!({"assistant_text": "te leo igual", "tool_calls": [], "patch": {}}),
    ));
    let transport = Arc::new(MockTransport::new());

    let config = OrchestratorConfig {
        fallback_to_llm: true,
        ..OrchestratorConfig::default()
    };
    let store = Arc::new(ManifestStore::new(Manifest::builtin()));
    let pipeline = Pipeline::new(&config, StageClients::shared(llm), transport, store);

    let response = pipeline.decide(snapshot("hola")).await;

    assert_eq!(response.telemetry.route, "legacy");
    assert_eq!(response.assistant.text, "te leo igual");
}

#[tokio::test]
async fn guardrail_violation_hands_off_and_counts_the_offence() {
    let llm = Arc::new(
        MockLlm::new()
            .reply(
                EXTRACTOR_SCHEMA,
                extraction(
                    "book",
                    0.95,
                    json!({
                        "service_type": "Corte",
                        "preferred_date": "2026-08-02",
                        "preferred_time": "03:00",
                        "client_name": "Juan",
                        "client_email": "juan@x.com"
                    }),
                ),
            )
            .reply(
                PLANNER_SCHEMA,
                json!({
                    "tool_calls": [{"tool": "create_booking", "args": {
                        "service_type": "Corte", "preferred_date": "2026-08-02",
                        "preferred_time": "03:00", "client_name": "Juan",
                        "client_email": "juan@x.com"
                    }}],
                    "requires_user_response": true
                }),
            ),
    );
    let transport = Arc::new(MockTransport::new());
    let pipeline = pipeline(llm, transport.clone());

    let response = pipeline.decide(snapshot("reservá a las 3am")).await;

    assert!(transport.invocations.lock().unwrap().is_empty());
    assert!(response.tool_calls.is_empty());
    assert!(!response.policy_denied);
    assert_eq!(
        response
            .patch
            .slots_set
            .get("_guardrail_offences")
            .and_then(SlotValue::as_f64),
        Some(1.0)
    );
    assert!(response.assistant.text.contains("persona del equipo"));
}
