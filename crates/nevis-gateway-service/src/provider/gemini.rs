//! Google Gemini adapter (`generateContent`).

use async_trait::async_trait;
use serde_json::json;

use nevis_gateway_core::{ProviderErrorKind, RequestClass};

use super::{GenerationOutput, GenerationRequest, ProviderAdapter, ProviderError};

/// Provider family name.
pub const PROVIDER: &str = "google";

/// One Gemini credential.
pub struct GeminiAdapter {
    id: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl GeminiAdapter {
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

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }

    fn payload(request: &GenerationRequest) -> serde_json::Value {
        let mut generation_config = json!({
            "temperature": request.temperature,
            "maxOutputTokens": request.max_tokens,
        });
        if request.class == RequestClass::Image {
            generation_config["responseModalities"] = json!(["IMAGE"]);
        }

        json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation_config,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        let response = self
            .client
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::payload(request))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(response).await);
        }

        let data: serde_json::Value = response.json().await?;

        // A 200 without candidates means the prompt was blocked.
        let has_candidates = data
            .get("candidates")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|c| !c.is_empty());
        if !has_candidates {
            let reason = data
                .pointer("/promptFeedback/blockReason")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("no candidates");
            return Err(ProviderError::new(
                ProviderErrorKind::Unsupported,
                format!("empty response: {reason}"),
            ));
        }

        Ok(GenerationOutput {
            data,
            model_used: request.model.clone(),
        })
    }
}
