//! Tool invoker interface.
//!
//! The executor treats the invoker as an opaque function from
//! `(tool, action, connection_id, args, timeout, idem_key)` to a result or
//! a classified error. The reference implementation posts to the SaaS
//! tool-execution endpoint; tests use a scripted double.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

/// Classification that drives executor retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeErrorKind {
    /// Network errors, provider 5xx, rate limits: retried with backoff.
    Retriable,
    /// Provider 4xx (except rate-limit) and argument validation: no retry.
    Fatal,
}

#[derive(Debug, Error, Clone)]
#[error("{kind:?} invocation failure: {message}")]
pub struct InvokeError {
    pub kind: InvokeErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl InvokeError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            kind: InvokeErrorKind::Retriable,
            message: message.into(),
            status: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: InvokeErrorKind::Fatal,
            message: message.into(),
            status: None,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == InvokeErrorKind::Retriable
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub tool: String,
    pub action: String,
    pub connection_id: String,
    pub arguments: Value,
    pub timeout_ms: u64,
    pub idempotency_key: String,
}

/// Executes one external action.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<Value, InvokeError>;
}

// ---------------------------------------------------------------------------
// HTTP reference implementation
// ---------------------------------------------------------------------------

/// Invoker that posts to the provider-execution REST endpoint.
pub struct HttpToolInvoker {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpToolInvoker {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> InvokeErrorKind {
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            InvokeErrorKind::Retriable
        } else {
            InvokeErrorKind::Fatal
        }
    }
}

#[async_trait]
impl ToolInvoker for HttpToolInvoker {
    #[instrument(skip(self, request), fields(action = %request.action, connection_id = %request.connection_id))]
    async fn invoke(&self, request: InvokeRequest) -> Result<Value, InvokeError> {
        let url = format!(
            "{}/api/v3/tools/execute/{}",
            self.base_url,
            request.action.to_uppercase()
        );
        let payload = serde_json::json!({
            "connected_account_id": request.connection_id,
            "arguments": request.arguments,
        });

        debug!(url = %url, timeout_ms = request.timeout_ms, "invoking tool action");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("x-idempotency-key", &request.idempotency_key)
            .timeout(std::time::Duration::from_millis(request.timeout_ms))
            .json(&payload)
            .send()
            .await
            .map_err(|e| InvokeError {
                kind: InvokeErrorKind::Retriable,
                message: format!("transport error: {e}"),
                status: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokeError {
                kind: Self::classify_status(status),
                message: format!("provider returned {status}: {body}"),
                status: Some(status.as_u16()),
            });
        }

        response.json().await.map_err(|e| InvokeError {
            kind: InvokeErrorKind::Fatal,
            message: format!("invalid response body: {e}"),
            status: Some(status.as_u16()),
        })
    }
}
