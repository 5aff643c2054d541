//! Authentication extractors.
//!
//! - `ServiceAuth` - calling application, via `x-api-key`
//! - `AdminAuth` - operator endpoints, via the same key (always required)

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the service API key.
pub const API_KEY_HEADER: &str = "x-api-key";

fn presented_key(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
}

/// Service authentication via API key.
///
/// When no `SERVICE_API_KEY` is configured the gateway runs open and every
/// request is accepted.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The calling service, from `x-service-name` if present.
    pub service_name: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        if let Some(expected) = &state.config.service_api_key {
            let api_key = presented_key(parts).ok_or(ApiError::Unauthorized)?;
            if !constant_time_eq(api_key, expected) {
                return Err(ApiError::Unauthorized);
            }
        }

        let service_name = parts
            .headers
            .get("x-service-name")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self { service_name })
    }
}

/// Admin authentication.
///
/// Unlike [`ServiceAuth`], a configured key is mandatory.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Admin identifier (for audit logging).
    pub admin_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let expected = state
            .config
            .service_api_key
            .as_ref()
            .ok_or(ApiError::Unauthorized)?;
        let api_key = presented_key(parts).ok_or(ApiError::Unauthorized)?;
        if !constant_time_eq(api_key, expected) {
            return Err(ApiError::Unauthorized);
        }

        let admin_id = parts
            .headers
            .get("x-admin-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("admin")
            .to_string();

        tracing::info!(admin_id = %admin_id, "Admin authenticated");

        Ok(Self { admin_id })
    }
}
