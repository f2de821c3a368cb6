//! `HttpNode`: issues an HTTP request built from the node's resolved
//! configuration.
//!
//! Expected configuration:
//!
//! ```json
//! {
//!   "method": "POST",
//!   "url": "https://api.example.com/users/{{.user_id}}",
//!   "headers": { "Authorization": "Bearer {{.token}}" },
//!   "body": { "email": "{{.email}}" },
//!   "expected_status": [200, 201]
//! }
//! ```
//!
//! Output is `{ "status": u16, "headers": {..}, "body": <json or string> }`.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{ExecutableNode, ExecutionContext, NodeError};

/// Maximum number of response-body characters quoted in an error message.
const ERROR_BODY_PREVIEW: usize = 256;

/// Resolved configuration of an `http` node.
#[derive(Debug, Deserialize)]
struct HttpConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    /// When set, only these statuses count as success.
    #[serde(default)]
    expected_status: Option<Vec<u16>>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Node implementation for the `http` node type.
#[derive(Debug, Clone, Default)]
pub struct HttpNode {
    client: Client,
}

impl HttpNode {
    pub const NODE_TYPE: &'static str = "http";

    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutableNode for HttpNode {
    async fn execute(&self, config: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let config: HttpConfig =
            serde_json::from_value(config).map_err(|e| NodeError::InvalidConfig(e.to_string()))?;

        let method = parse_method(&config.method)?;
        let url = Url::parse(&config.url)
            .map_err(|e| NodeError::InvalidConfig(format!("invalid url '{}': {e}", config.url)))?;

        debug!(node_id = %ctx.node_id, attempt = ctx.attempt, %method, %url, "sending http request");

        let mut request = self.client.request(method, url);
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }
        request = match config.body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text),
            Some(body) => request.json(&body),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                NodeError::InvalidConfig(e.to_string())
            } else {
                NodeError::Retryable(format!("transport error: {e}"))
            }
        })?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| NodeError::Retryable(format!("failed to read response body: {e}")))?;

        classify_status(status.as_u16(), config.expected_status.as_deref(), &text)?;

        // Try to parse body as JSON, fall back to string.
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }
}

/// Decide whether a response status is a success, a retryable failure or a
/// fatal failure.
fn classify_status(status: u16, expected: Option<&[u16]>, body: &str) -> Result<(), NodeError> {
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();

    if let Some(expected) = expected {
        if expected.contains(&status) {
            return Ok(());
        }
        return Err(NodeError::Fatal(format!(
            "unexpected status {status} (expected one of {expected:?}): {preview}"
        )));
    }

    match status {
        200..=299 => Ok(()),
        500..=599 => Err(NodeError::Retryable(format!("server error {status}: {preview}"))),
        _ => Err(NodeError::Fatal(format!("request failed with status {status}: {preview}"))),
    }
}

fn parse_method(method: &str) -> Result<Method, NodeError> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "DELETE" => Ok(Method::DELETE),
        "PATCH" => Ok(Method::PATCH),
        "HEAD" => Ok(Method::HEAD),
        "OPTIONS" => Ok(Method::OPTIONS),
        _ => Err(NodeError::InvalidConfig(format!("unsupported HTTP method: {method}"))),
    }
}
