//! Monthly request quota.
//!
//! A cap on successful generations per user per calendar month (UTC),
//! counted on top of the credit ledger. A request is checked before it is
//! charged and counted only once its result has been handed to the caller.
//! A limit of `0` turns the cap off.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use nevis_gateway_core::UserId;
use nevis_gateway_store::{Store, StoreError};

use crate::error::ApiError;

/// Default successful generations per user per month.
pub const DEFAULT_MONTHLY_REQUEST_LIMIT: u32 = 40;

/// A user's usage in the current month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    /// User ID.
    pub user_id: String,
    /// Successful generations this month.
    pub current_usage: u32,
    /// Cap for the month; `0` means unlimited.
    pub monthly_limit: u32,
    /// Generations left this month.
    pub remaining: u32,
    /// Month as `YYYY-MM`.
    pub month: String,
}

/// Per-user monthly counters.
pub struct QuotaTracker {
    store: Arc<dyn Store>,
    limit: u32,
}

impl QuotaTracker {
    /// Create a tracker with the given monthly limit.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, limit: u32) -> Self {
        Self { store, limit }
    }

    /// Configured monthly limit.
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Usage for the current month.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read.
    pub fn usage(&self, user_id: &UserId) -> Result<QuotaUsage, StoreError> {
        self.usage_at(user_id, Utc::now())
    }

    /// Usage for the month containing `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read.
    pub fn usage_at(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<QuotaUsage, StoreError> {
        let month = period(now);
        let used = self.store.request_count(user_id, &month)?;
        Ok(self.summary(user_id, used, month))
    }

    /// Reject the request if the user has used up this month's quota.
    ///
    /// # Errors
    ///
    /// - [`ApiError::QuotaExceeded`] when the cap is reached.
    /// - [`ApiError::LedgerStorage`] if the counter cannot be read.
    pub fn check(&self, user_id: &UserId) -> Result<QuotaUsage, ApiError> {
        self.check_at(user_id, Utc::now())
    }

    /// [`QuotaTracker::check`] against an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`QuotaTracker::check`].
    pub fn check_at(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<QuotaUsage, ApiError> {
        let usage = self.usage_at(user_id, now)?;
        if self.limit > 0 && usage.current_usage >= self.limit {
            tracing::warn!(
                user_id = %user_id,
                used = usage.current_usage,
                limit = self.limit,
                "Monthly quota exceeded"
            );
            return Err(ApiError::QuotaExceeded {
                used: usage.current_usage,
                limit: self.limit,
            });
        }
        Ok(usage)
    }

    /// Count one served request and return the month's total.
    ///
    /// Counter failures are logged; the served request is not failed for them.
    pub fn record(&self, user_id: &UserId, checked: &QuotaUsage) -> u32 {
        self.record_at(user_id, checked, Utc::now())
    }

    fn record_at(&self, user_id: &UserId, checked: &QuotaUsage, now: DateTime<Utc>) -> u32 {
        match self.store.increment_request_count(user_id, &period(now)) {
            Ok(count) => {
                tracing::info!(user_id = %user_id, count, limit = self.limit, "Quota updated");
                count
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to update quota");
                checked.current_usage.saturating_add(1)
            }
        }
    }

    fn summary(&self, user_id: &UserId, used: u32, month: String) -> QuotaUsage {
        let remaining = if self.limit == 0 {
            u32::MAX
        } else {
            self.limit.saturating_sub(used)
        };
        QuotaUsage {
            user_id: user_id.to_string(),
            current_usage: used,
            monthly_limit: self.limit,
            remaining,
            month,
        }
    }
}

/// Calendar month of `now` as `YYYY-MM`.
#[must_use]
pub fn period(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}
