//! `OpenRouter` adapter (OpenAI-compatible chat completions).
//!
//! Used as the cross-provider fallback once every Gemini credential failed.

use async_trait::async_trait;
use serde_json::json;

use nevis_gateway_core::{ProviderErrorKind, RequestClass};

use super::{GenerationOutput, GenerationRequest, ProviderAdapter, ProviderError};
use crate::config::ModelCatalog;

/// Provider family name.
pub const PROVIDER: &str = "openrouter";

const REFERER: &str = "https://nevis.ai";
const TITLE: &str = "Nevis AI";

/// `OpenRouter` adapter bound to one API key.
pub struct OpenRouterAdapter {
    id: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenRouterAdapter {
    /// Create an adapter bound to one API key.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            id: id.into(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn payload(request: &GenerationRequest) -> serde_json::Value {
        let mut payload = json!({
            "model": ModelCatalog::openrouter_model(&request.model),
            "messages": [{ "role": "user", "content": request.prompt }],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if request.class == RequestClass::Image {
            payload["modalities"] = json!(["image", "text"]);
        }
        payload
    }
}

#[async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .json(&Self::payload(request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(response).await);
        }

        let data: serde_json::Value = response.json().await?;

        // OpenRouter reports some upstream failures inside a 200 body.
        if let Some(error) = data.get("error") {
            let code = error
                .get("code")
                .and_then(serde_json::Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .and_then(|c| reqwest::StatusCode::from_u16(c).ok());
            let kind = code.map_or(ProviderErrorKind::ServerError, super::classify_status);
            return Err(ProviderError::new(kind, error.to_string()));
        }

        let model_used = data
            .get("model")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| ModelCatalog::openrouter_model(&request.model), String::from);

        Ok(GenerationOutput { data, model_used })
    }
}
