//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, credits, generate, health, quota, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent generation requests. Each one may hold provider
/// connections for the whole fallback chain.
const GENERATE_MAX_CONCURRENT_REQUESTS: usize = 64;

/// Maximum concurrent requests for credit lookups.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Fallback chain and breaker status
///
/// ## Generation (Service API Key auth, rate-limited)
/// - `POST /generate-image`
/// - `POST /generate-text`
///
/// ## Credits (Service API Key auth)
/// - `GET /credits/{user_id}` - Balance summary
/// - `GET /credits/{user_id}/transactions` - Transaction history
/// - `GET /quota/{user_id}` - Monthly request quota
///
/// ## Webhooks (Signature verification)
/// - `POST /api/webhooks/payment` - Stripe checkout events
///
/// ## Admin (Service API Key required)
/// - `POST /admin/adapters/{id}/reset` - Close a circuit breaker
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let generate_routes = Router::new()
        .route("/generate-image", post(generate::generate_image))
        .route("/generate-text", post(generate::generate_text))
        .layer(ConcurrencyLimitLayer::new(GENERATE_MAX_CONCURRENT_REQUESTS));

    let credit_routes = Router::new()
        .route("/credits/:user_id", get(credits::get_credits))
        .route("/credits/:user_id/transactions", get(credits::list_transactions))
        .route("/quota/:user_id", get(quota::get_quota))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        .merge(generate_routes)
        .merge(credit_routes)
        // Webhooks (no rate limit - controlled by the payment provider)
        .route("/api/webhooks/payment", post(webhooks::payment_webhook))
        .route("/admin/adapters/:id/reset", post(admin::reset_adapter))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
