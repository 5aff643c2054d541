//! Nevis AI Generation Gateway HTTP service.
//!
//! This crate provides the HTTP API in front of the AI providers:
//!
//! - Image and text generation with credit metering
//! - Fallback routing across Gemini credentials and `OpenRouter`
//! - Per-adapter circuit breakers
//! - Credit balances and transaction history
//! - A monthly per-user request cap
//! - Stripe payment webhooks
//!
//! # Request pipeline
//!
//! Every generation request is charged before any provider is called. The
//! router then walks the tier chain; if every tier fails the charge is
//! refunded under a key derived from the deduction key. The same refund runs
//! when the caller goes away before the result is delivered.
//!
//! # Features
//!
//! - `rocksdb-backend` (default): persistent storage.
//! - `test-util`: exports `ScriptedAdapter` for integration tests.
//!
//! # Authentication
//!
//! Generation, credits and admin routes use the service API key
//! (`x-api-key`). Webhooks are authenticated by their Stripe signature.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers stay async for a uniform signature

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod ledger;
pub mod provider;
pub mod quota;
pub mod reconciler;
pub mod recorder;
pub mod router;
pub mod routes;
pub mod state;
pub mod stripe;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use gateway::{GenerateCommand, GenerateResult, GenerationFailure, GenerationGateway};
pub use health::{BreakerState, HealthTracker};
pub use ledger::{Balance, CreditLedger, LedgerReceipt};
pub use provider::{GenerationOutput, GenerationRequest, ProviderAdapter, ProviderError};
#[cfg(any(test, feature = "test-util"))]
pub use provider::ScriptedAdapter;
pub use quota::{QuotaTracker, QuotaUsage};
pub use reconciler::{PaymentReconciler, ReconcileOutcome};
pub use recorder::UsageRecorder;
pub use router::{FallbackRouter, RouteOutcome, Tier};
pub use routes::create_router;
pub use state::AppState;
pub use stripe::StripeError;
