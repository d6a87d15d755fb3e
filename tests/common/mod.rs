//! Shared scripted doubles for the integration suites: a JSON-mode client
//! that replays canned replies per schema, and a tool transport whose
//! behaviour is scripted per tool.

// Not every suite exercises every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use charla::charla::broker::{
    ToolErrorBody, ToolInvocation, ToolResponse, ToolTransport, TransportError,
};
use charla::charla::llm::{JsonModeClient, LlmError};

/// Scripted JSON-mode client. Replies are queued per schema identifier and
/// consumed in order; the last reply for a schema repeats forever so
/// multi-turn tests stay short.
pub struct MockLlm {
    replies: Mutex<HashMap<String, Vec<Value>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue one reply for a schema (builder pattern).
    pub fn reply(self, schema: &str, value: Value) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default()
            .push(value);
        self
    }

    /// Number of completions issued for a schema.
    pub fn calls_for(&self, schema: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == schema)
            .count()
    }
}

#[async_trait]
impl JsonModeClient for MockLlm {
    async fn complete_json(&self, schema: &str, _system: &str, _user: &str) -> Result<Value, LlmError> {
        self.calls.lock().unwrap().push(schema.to_string());
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(schema) {
            Some(queue) if queue.len() > 1 => Ok(queue.remove(0)),
            Some(queue) if queue.len() == 1 => Ok(queue[0].clone()),
            _ => Err(LlmError::Unavailable(format!(
                "no scripted reply for schema {}",
                schema
            ))),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

/// One scripted transport outcome.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// 2xx with `{ok: true, data}`.
    Ok(Value),
    /// 2xx with `{ok: false, error: {kind}}`.
    AppFail(&'static str),
    /// Non-2xx HTTP status.
    Http(u16),
    /// Connection-level failure.
    Network,
    /// Sleep longer than any per-attempt timeout in the test manifest.
    Hang(Duration),
}

/// Scripted tool transport. Behaviours are queued per tool and consumed in
/// order; the last one repeats. Every invocation is recorded for
/// idempotency-key assertions.
pub struct MockTransport {
    scripts: Mutex<HashMap<String, Vec<Behavior>>>,
    pub invocations: Mutex<Vec<ToolInvocation>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Queue a behaviour for a tool (builder pattern).
    pub fn behave(self, tool: &str, behavior: Behavior) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(tool.to_string())
            .or_default()
            .push(behavior);
        self
    }

    /// All recorded invocations of one tool.
    pub fn invocations_of(&self, tool: &str) -> Vec<ToolInvocation> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.tool == tool)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ToolTransport for MockTransport {
    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResponse, TransportError> {
        let behavior = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&invocation.tool) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) if queue.len() == 1 => queue[0].clone(),
                _ => Behavior::Http(404),
            }
        };
        self.invocations.lock().unwrap().push(invocation);

        match behavior {
            Behavior::Ok(data) => Ok(ToolResponse {
                ok: true,
                data: Some(data),
                error: None,
            }),
            Behavior::AppFail(kind) => Ok(ToolResponse {
                ok: false,
                data: None,
                error: Some(ToolErrorBody {
                    kind: kind.to_string(),
                    message: String::new(),
                }),
            }),
            Behavior::Http(status) => Err(TransportError::Status(status)),
            Behavior::Network => Err(TransportError::Network("connection reset".to_string())),
            Behavior::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(ToolResponse {
                    ok: true,
                    data: Some(Value::Null),
                    error: None,
                })
            }
        }
    }
}
