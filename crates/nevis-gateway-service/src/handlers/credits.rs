//! Credit balance handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use nevis_gateway_core::{CreditTransaction, UserId, UserTier};

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Default page size for transaction listings.
const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest page size for transaction listings.
const MAX_PAGE_SIZE: usize = 100;

/// Credit summary for a user.
#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    /// User ID.
    pub user_id: String,
    /// Plan tier.
    pub tier: UserTier,
    /// Credits available.
    pub credits_remaining: i64,
    /// Credits ever granted or purchased.
    pub total_credits: i64,
    /// Credits consumed, net of refunds.
    pub used_credits: i64,
    /// Estimated provider spend in USD.
    pub total_ai_cost_incurred: f64,
}

/// `GET /credits/{user_id}`
pub async fn get_credits(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
) -> Result<Json<CreditsResponse>, ApiError> {
    let user_id = parse_user_id(user_id)?;

    let balance = state.ledger.balance(&user_id).await?;
    let total_ai_cost_incurred = state.recorder.total_ai_cost_usd(&user_id)?;

    Ok(Json(CreditsResponse {
        user_id: user_id.to_string(),
        tier: balance.tier,
        credits_remaining: balance.remaining,
        total_credits: balance.total,
        used_credits: balance.used,
        total_ai_cost_incurred,
    }))
}

/// Query parameters for listing transactions.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of transactions to return.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Number of transactions to skip.
    #[serde(default)]
    pub offset: usize,
}

const fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Transaction list response.
#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    /// User ID.
    pub user_id: String,
    /// Transactions, newest first.
    pub transactions: Vec<CreditTransaction>,
    /// Applied page size.
    pub limit: usize,
    /// Applied offset.
    pub offset: usize,
}

/// `GET /credits/{user_id}/transactions`
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Path(user_id): Path<String>,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<TransactionsResponse>, ApiError> {
    let user_id = parse_user_id(user_id)?;
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);

    let transactions = state
        .ledger
        .transactions(&user_id, limit, query.offset)
        .await?;

    Ok(Json(TransactionsResponse {
        user_id: user_id.to_string(),
        transactions,
        limit,
        offset: query.offset,
    }))
}

pub(super) fn parse_user_id(raw: String) -> Result<UserId, ApiError> {
    UserId::new(raw).map_err(|_| ApiError::BadRequest("Invalid user ID".into()))
}
