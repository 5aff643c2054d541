//! Provider adapters.
//!
//! Every AI backend sits behind [`ProviderAdapter`]. An adapter instance is
//! bound to one credential set, makes the network call and maps vendor
//! failures onto [`ProviderErrorKind`]. It never touches credits or health;
//! the router owns both.

pub mod gemini;
pub mod openrouter;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

use async_trait::async_trait;
use reqwest::StatusCode;

use nevis_gateway_core::{ProviderErrorKind, RequestClass};

pub use gemini::GeminiAdapter;
pub use openrouter::OpenRouterAdapter;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedAdapter;

/// Longest vendor error body kept in logs.
const MAX_ERROR_BODY: usize = 512;

/// Normalized generation request handed to adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Image or text.
    pub class: RequestClass,
    /// User prompt.
    pub prompt: String,
    /// Gemini model name from the allow-list.
    pub model: String,
    /// Output token cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Normalized generation result.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Vendor response body, passed through to the caller.
    pub data: serde_json::Value,
    /// Model that produced the content, as named by the vendor.
    pub model_used: String,
}

/// A classified provider failure.
///
/// `message` carries vendor detail for logs only; callers see `kind`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    /// Classification driving retry and failover.
    pub kind: ProviderErrorKind,
    /// Vendor detail.
    pub message: String,
}

impl ProviderError {
    /// Create a new provider error.
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error from a non-success HTTP response.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Self::new(classify_status(status), format!("HTTP {status}: {body}"))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(classify_transport(&err), err.to_string())
    }
}

/// Uniform interface over AI backends.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Unique adapter id, used as the circuit breaker key.
    fn id(&self) -> &str;

    /// Provider family reported as `provider_used` (e.g. "google").
    fn provider(&self) -> &str;

    /// Whether this adapter can serve the request class.
    fn supports(&self, _class: RequestClass) -> bool {
        true
    }

    /// Perform one generation call.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError>;
}

/// Map an HTTP status onto the error taxonomy.
#[must_use]
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Auth,
        402 | 429 => ProviderErrorKind::QuotaExceeded,
        408 | 504 => ProviderErrorKind::Timeout,
        500..=599 => ProviderErrorKind::ServerError,
        _ => ProviderErrorKind::Unsupported,
    }
}

/// Map a transport-level failure onto the error taxonomy.
#[must_use]
pub fn classify_transport(err: &reqwest::Error) -> ProviderErrorKind {
    if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ProviderErrorKind::ServerError
    } else {
        // Undecodable responses and builder errors will fail again on retry.
        ProviderErrorKind::Unsupported
    }
}
