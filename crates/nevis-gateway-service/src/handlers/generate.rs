//! Generation handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use nevis_gateway_core::{RequestClass, UserId};

use crate::auth::ServiceAuth;
use crate::config::{ModelCatalog, RevoVersion};
use crate::error::ApiError;
use crate::gateway::GenerateCommand;
use crate::provider::GenerationRequest;
use crate::state::AppState;

/// Default output token cap.
const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Largest accepted output token cap.
const MAX_TOKENS_LIMIT: u32 = 8192;

/// Default sampling temperature.
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Longest accepted prompt, in characters.
const MAX_PROMPT_CHARS: usize = 32_000;

/// Generation request body.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    /// User prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Paying user.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Tier as known by the calling application.
    #[serde(default)]
    pub user_tier: Option<String>,
    /// Model from the allow-list; defaults per class.
    #[serde(default)]
    pub model: Option<String>,
    /// Output token cap.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature in `0.0..=2.0`.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Credential set ("1.0", "1.5", "2.0").
    #[serde(default)]
    pub revo_version: Option<String>,
    /// Caller request id; retries with the same id are charged once.
    #[serde(default)]
    pub request_id: Option<String>,
    /// How long the caller will wait, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Successful generation response.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    /// Always `true`.
    pub success: bool,
    /// Provider response body.
    pub data: serde_json::Value,
    /// Model that produced the content.
    pub model_used: String,
    /// Provider family that served the request.
    pub provider_used: String,
    /// Tier label that served the request.
    pub fallback_level: String,
    /// Credits left after the charge.
    pub user_credits: i64,
    /// Successful generations this month, including this one.
    pub user_quota: u32,
}

/// `POST /generate-image`
pub async fn generate_image(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    generate(&state, &auth, RequestClass::Image, body).await
}

/// `POST /generate-text`
pub async fn generate_text(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    generate(&state, &auth, RequestClass::Text, body).await
}

async fn generate(
    state: &AppState,
    auth: &ServiceAuth,
    class: RequestClass,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let http_timeout = Duration::from_secs(state.config.request_timeout_seconds);
    let command = build_command(body, class, &state.config.models, http_timeout)?;
    let user_id = command.user_id.clone();
    let quota = state.quota.check(&user_id)?;

    tracing::debug!(
        service = %auth.service_name,
        user_id = %command.user_id,
        class = %class,
        model = %command.request.model,
        revo_version = %command.version,
        "Processing generation request"
    );

    let result = state.gateway.generate(command).await?;
    let user_quota = state.quota.record(&user_id, &quota);

    Ok(Json(GenerateResponse {
        success: true,
        data: result.output.data,
        model_used: result.output.model_used,
        provider_used: result.provider,
        fallback_level: result.tier,
        user_credits: result.remaining,
        user_quota,
    }))
}

/// Validate a request body. Nothing is charged for a rejected request.
///
/// The generation deadline is the caller's `timeout_ms`, capped by the HTTP
/// request timeout.
fn build_command(
    body: GenerateRequest,
    class: RequestClass,
    models: &ModelCatalog,
    http_timeout: Duration,
) -> Result<GenerateCommand, ApiError> {
    let prompt = body
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("prompt is required".into()))?;
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::BadRequest(format!(
            "prompt exceeds {MAX_PROMPT_CHARS} characters"
        )));
    }

    let user_id = body
        .user_id
        .ok_or_else(|| ApiError::BadRequest("user_id is required".into()))?;
    let user_id = UserId::new(user_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let max_tokens = body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    if !(1..=MAX_TOKENS_LIMIT).contains(&max_tokens) {
        return Err(ApiError::BadRequest(format!(
            "max_tokens must be between 1 and {MAX_TOKENS_LIMIT}"
        )));
    }

    let temperature = body.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ApiError::BadRequest(
            "temperature must be between 0.0 and 2.0".into(),
        ));
    }

    let version = body
        .revo_version
        .as_deref()
        .map(str::parse::<RevoVersion>)
        .transpose()
        .map_err(ApiError::BadRequest)?
        .unwrap_or_default();

    let model = models
        .resolve(class, body.model.as_deref())
        .map_err(ApiError::BadRequest)?;

    let request_key = body
        .request_id
        .filter(|id| !id.trim().is_empty());

    let deadline = match body.timeout_ms {
        Some(0) => return Err(ApiError::BadRequest("timeout_ms must be positive".into())),
        Some(ms) => Duration::from_millis(ms).min(http_timeout),
        None => http_timeout,
    };

    Ok(GenerateCommand {
        user_id,
        version,
        request: GenerationRequest {
            class,
            prompt,
            model,
            max_tokens,
            temperature,
        },
        request_key,
        user_tier: body.user_tier,
        deadline: Some(deadline),
    })
}
