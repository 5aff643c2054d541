//! Payment events delivered by the payment provider's webhooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// A completed payment that grants credits.
///
/// `external_session_id` determines at most one successful top-up, however
/// many times the webhook is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Checkout session id from the payment provider.
    pub external_session_id: String,

    /// The user being credited.
    pub user_id: UserId,

    /// Plan or credit pack purchased.
    pub plan_id: String,

    /// Credits granted by this payment.
    pub credits_to_add: i64,

    /// Amount paid in cents.
    pub amount: i64,

    /// When the event was processed by the gateway.
    pub processed_at: DateTime<Utc>,
}

impl PaymentEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(
        external_session_id: impl Into<String>,
        user_id: UserId,
        plan_id: impl Into<String>,
        credits_to_add: i64,
        amount: i64,
    ) -> Self {
        Self {
            external_session_id: external_session_id.into(),
            user_id,
            plan_id: plan_id.into(),
            credits_to_add,
            amount,
            processed_at: Utc::now(),
        }
    }
}
