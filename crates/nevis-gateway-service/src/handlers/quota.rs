//! Quota handler.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use super::credits::parse_user_id;
use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::quota::QuotaUsage;
use crate::state::AppState;

/// `GET /quota/{user_id}`
pub async fn get_quota(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<QuotaUsage>, ApiError> {
    let user_id = parse_user_id(user_id)?;
    Ok(Json(state.quota.usage(&user_id)?))
}
