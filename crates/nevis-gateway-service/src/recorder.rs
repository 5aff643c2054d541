//! Usage recorder.
//!
//! Appends one [`GenerationAttempt`] per routed request. Audit writes never
//! fail a request: errors are logged and swallowed.

use std::sync::Arc;

use nevis_gateway_core::{micros_to_usd, GenerationAttempt, PricingConfig, RequestClass, UserId};
use nevis_gateway_store::{Store, StoreError};

/// Writes and aggregates generation audit rows.
pub struct UsageRecorder {
    store: Arc<dyn Store>,
    pricing: PricingConfig,
}

impl UsageRecorder {
    /// Create a recorder.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, pricing: PricingConfig) -> Self {
        Self { store, pricing }
    }

    /// Estimated provider spend for a call served by `provider`.
    ///
    /// Failed attempts (no provider) cost nothing.
    #[must_use]
    pub fn estimated_cost_usd_micros(&self, provider: Option<&str>, class: RequestClass) -> i64 {
        provider.map_or(0, |p| self.pricing.provider_cost_usd_micros(p, class))
    }

    /// Persist an attempt.
    pub fn record(&self, attempt: &GenerationAttempt) {
        match self.store.put_attempt(attempt) {
            Ok(()) => tracing::debug!(
                attempt_id = %attempt.id,
                user_id = %attempt.user_id,
                tier = %attempt.provider_tier,
                success = attempt.success,
                latency_ms = attempt.latency_ms,
                "Generation attempt recorded"
            ),
            Err(e) => tracing::error!(
                attempt_id = %attempt.id,
                user_id = %attempt.user_id,
                error = %e,
                "Failed to record generation attempt"
            ),
        }
    }

    /// Total estimated provider spend for a user, in USD.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempts cannot be read.
    pub fn total_ai_cost_usd(&self, user_id: &UserId) -> Result<f64, StoreError> {
        Ok(micros_to_usd(self.store.attempt_cost_usd_micros(user_id)?))
    }

    /// Attempts for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempts cannot be read.
    pub fn attempts(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationAttempt>, StoreError> {
        self.store.list_attempts_by_user(user_id, limit, offset)
    }
}
