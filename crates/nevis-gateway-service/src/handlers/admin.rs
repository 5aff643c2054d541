//! Operator endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::health::BreakerState;
use crate::state::AppState;

/// Breaker reset response.
#[derive(Debug, Serialize)]
pub struct ResetResponse {
    /// Adapter id.
    pub adapter: String,
    /// State after the reset.
    pub state: BreakerState,
}

/// `POST /admin/adapters/{id}/reset`
pub async fn reset_adapter(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Path(adapter): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    if !state.router.knows_adapter(&adapter) || !state.health.reset(&adapter) {
        return Err(ApiError::NotFound(format!("Unknown adapter: {adapter}")));
    }

    tracing::info!(admin_id = %auth.admin_id, adapter = %adapter, "Circuit breaker reset by admin");

    Ok(Json(ResetResponse {
        adapter,
        state: BreakerState::Closed,
    }))
}
