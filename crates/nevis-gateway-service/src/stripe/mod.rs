//! Stripe integration for payment webhooks.
//!
//! Stripe delivers `checkout.session.completed` events at least once; the
//! gateway verifies their signature here and hands them to the reconciler.

pub mod signature;
pub mod types;

pub use signature::{sign_payload, verify_webhook_signature, StripeError};
pub use types::*;
