//! Provider-agnostic JSON-mode completion client.
//!
//! Every LLM-backed stage (extractor, planner, NLG fallback, legacy path)
//! talks to the inference backend through the [`JsonModeClient`] trait: a
//! system prompt, a user prompt, and a schema identifier the backend can
//! reject on mismatch. The trait keeps stages testable with scripted mocks
//! and keeps vendor wiring out of the pipeline.
//!
//! Timeouts and retries are owned by the calling stage; the client itself
//! performs exactly one round trip per call. The one sanctioned retry shape
//! is [`complete_with_repair`]: a bounded single repair pass that re-asks
//! the model with its own invalid reply and the validation error appended.

use async_trait::async_trait;
use serde_json::Value;

/// Result alias for JSON-mode completions.
pub type LlmResult<T> = Result<T, LlmError>;

/// Errors surfaced by a JSON-mode completion.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// The backend could not be reached or answered with a server error.
    Unavailable(String),
    /// The stage budget expired before a reply arrived.
    Timeout,
    /// The reply did not validate against the requested schema, even after
    /// the repair pass.
    SchemaInvalid(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Unavailable(msg) => write!(f, "llm unavailable: {}", msg),
            LlmError::Timeout => write!(f, "llm timeout"),
            LlmError::SchemaInvalid(msg) => write!(f, "schema invalid: {}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

/// Trait-driven abstraction over the inference backend's JSON mode.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so a single
/// client can be shared across concurrent requests.
#[async_trait]
pub trait JsonModeClient: Send + Sync {
    /// Run one JSON-mode completion.
    ///
    /// `schema` is an identifier (e.g. `extractor_v1`) forwarded to the
    /// backend; the returned value is the parsed JSON document. Semantic
    /// validation against the schema happens in the calling stage.
    async fn complete_json(&self, schema: &str, system: &str, user: &str) -> LlmResult<Value>;

    /// Identifier of the upstream model, for logs and telemetry.
    fn model_name(&self) -> &str;
}

/// Reqwest-backed [`JsonModeClient`] speaking the workflow platform's
/// inference endpoint.
///
/// The endpoint accepts `{model, schema, system, user}` and answers with
/// the completed JSON document as the response body. Non-2xx answers map
/// to [`LlmError::Unavailable`]; a body that is not JSON maps to
/// [`LlmError::SchemaInvalid`].
pub struct HttpJsonModeClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpJsonModeClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }

    /// Share an existing connection pool instead of building a new one.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl JsonModeClient for HttpJsonModeClient {
    async fn complete_json(&self, schema: &str, system: &str, user: &str) -> LlmResult<Value> {
        let body = serde_json::json!({
            "model": self.model,
            "schema": schema,
            "system": system,
            "user": user,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Unavailable(format!(
                "backend answered {}",
                status
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| LlmError::SchemaInvalid(e.to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// One completion plus at most one repair pass.
///
/// `parse` validates and converts the raw document; its error string is
/// fed back to the model verbatim on the repair attempt. If the second
/// reply still fails validation the error becomes [`LlmError::SchemaInvalid`].
///
/// # Example
///
/// ```ignore
/// let extraction = complete_with_repair(client, "extractor_v1", &system, &user, |v| {
///     parse_extraction(v)
/// })
/// .await?;
/// ```
pub async fn complete_with_repair<T, F>(
    client: &dyn JsonModeClient,
    schema: &str,
    system: &str,
    user: &str,
    parse: F,
) -> LlmResult<T>
where
    F: Fn(&Value) -> Result<T, String>,
{
    let first = client.complete_json(schema, system, user).await?;
    let first_err = match parse(&first) {
        Ok(value) => return Ok(value),
        Err(reason) => reason,
    };

    log::warn!(
        "reply failed {} validation ({}), attempting one repair",
        schema,
        first_err
    );

    let repair_user = format!(
        "{}\n\nYour previous reply was:\n{}\n\nIt failed validation against `{}`: {}\nAnswer again with corrected JSON only.",
        user, first, schema, first_err
    );
    let second = client.complete_json(schema, system, &repair_user).await?;
    parse(&second).map_err(LlmError::SchemaInvalid)
}
