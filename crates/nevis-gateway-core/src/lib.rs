//! Core types for the Nevis AI generation gateway.
//!
//! This crate provides the types shared by the store and the service:
//!
//! - **Identifiers**: `UserId`, `TransactionId`, `AttemptId`
//! - **Accounts**: `CreditAccount`, `UserTier`
//! - **Ledger**: `CreditTransaction`, `TransactionKind`
//! - **Audit**: `GenerationAttempt`, `RequestClass`
//! - **Payments**: `PaymentEvent`
//! - **Pricing**: `PricingConfig`
//! - **Errors**: `ErrorKind`, `ProviderErrorKind`, `GatewayError`
//!
//! # Credit Unit
//!
//! Credits are whole units stored as `i64`. An image request costs a few
//! credits, a text request one; the exact prices are configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod attempt;
pub mod credits;
pub mod error;
pub mod ids;
pub mod payment;
pub mod pricing;

pub use account::{CreditAccount, UserTier, DEFAULT_FREE_TIER_CREDITS};
pub use attempt::{GenerationAttempt, RequestClass, EXHAUSTED_TIER};
pub use credits::{CreditTransaction, TransactionKind};
pub use error::{ErrorKind, GatewayError, ProviderErrorKind, Result};
pub use ids::{AttemptId, IdError, TransactionId, UserId};
pub use payment::PaymentEvent;
pub use pricing::{micros_to_usd, PricingConfig, ProviderCostKey};
