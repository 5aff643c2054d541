//! Health check handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use nevis_gateway_core::RequestClass;

use crate::config::RevoVersion;
use crate::health::{AdapterHealthSnapshot, BreakerState};
use crate::router::FallbackLevel;
use crate::state::AppState;

/// Which Gemini keys are configured for one Revo version.
#[derive(Debug, Serialize)]
pub struct KeyStatus {
    /// Primary key present.
    pub primary_configured: bool,
    /// Secondary key present.
    pub secondary_configured: bool,
    /// Tertiary key present.
    pub tertiary_configured: bool,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy", "degraded" or "unavailable".
    pub status: &'static str,
    /// Summary of the fallback chain.
    pub fallback_system: String,
    /// Key configuration per Revo version.
    pub api_key_status: BTreeMap<&'static str, KeyStatus>,
    /// Whether the cross-provider fallback is configured.
    pub openrouter_configured: bool,
    /// Models accepted by the generation routes.
    pub allowed_models: Vec<String>,
    /// Tier chain of the default Revo version.
    pub fallback_levels: Vec<FallbackLevel>,
    /// Breaker state of every adapter.
    pub adapters: Vec<AdapterHealthSnapshot>,
    /// Service version.
    pub version: &'static str,
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let credentials = &state.config.credentials;

    let api_key_status = RevoVersion::ALL
        .iter()
        .map(|version| {
            let keys = credentials.gemini_keys(*version);
            (
                version.as_str(),
                KeyStatus {
                    primary_configured: keys.primary.is_some(),
                    secondary_configured: keys.secondary.is_some(),
                    tertiary_configured: keys.tertiary.is_some(),
                },
            )
        })
        .collect();

    let fallback_levels = state
        .router
        .fallback_levels(RevoVersion::default(), RequestClass::Image);
    let adapters = state.health.snapshot();

    let open = adapters
        .iter()
        .filter(|a| a.state != BreakerState::Closed)
        .count();
    let status = if adapters.is_empty() || open == adapters.len() {
        "unavailable"
    } else if open > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status,
        fallback_system: format!("{}-tier", fallback_levels.len()),
        api_key_status,
        openrouter_configured: credentials.openrouter_api_key.is_some(),
        allowed_models: state.config.models.allowed(),
        fallback_levels,
        adapters,
        version: env!("CARGO_PKG_VERSION"),
    })
}
