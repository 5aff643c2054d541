//! Stripe webhook types.

use serde::Deserialize;

/// Event type that grants credits.
pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";

/// Stripe webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
    /// Created timestamp (Unix).
    #[serde(default)]
    pub created: i64,
}

/// Webhook event data container.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The event object.
    pub object: serde_json::Value,
}

/// Stripe Checkout session object (the fields the gateway reads).
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    /// Session ID.
    pub id: String,
    /// Payment status ("paid", "unpaid", "no_payment_required").
    #[serde(default)]
    pub payment_status: Option<String>,
    /// Total amount in cents.
    #[serde(default)]
    pub amount_total: Option<i64>,
    /// Client reference ID (our `user_id`).
    #[serde(default)]
    pub client_reference_id: Option<String>,
    /// Metadata set when the session was created.
    #[serde(default)]
    pub metadata: CheckoutMetadata,
}

impl CheckoutSession {
    /// Whether the customer has paid.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }
}

/// Checkout metadata written by the web application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutMetadata {
    /// Credits bought, as a decimal string.
    #[serde(default)]
    pub credits_amount: Option<String>,
    /// Plan or credit pack id.
    #[serde(default)]
    pub plan_id: Option<String>,
    /// User id, when `client_reference_id` was not set.
    #[serde(default)]
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checkout_completed_event() {
        let json = serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "cs_test_1",
                "payment_status": "paid",
                "amount_total": 999,
                "client_reference_id": "user_1",
                "metadata": { "credits_amount": "50", "plan_id": "pro" }
            }}
        });

        let event: WebhookEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.event_type, CHECKOUT_SESSION_COMPLETED);

        let session: CheckoutSession = serde_json::from_value(event.data.object).unwrap();
        assert!(session.is_paid());
        assert_eq!(session.metadata.credits_amount.as_deref(), Some("50"));
        assert_eq!(session.amount_total, Some(999));
    }

    #[test]
    fn metadata_is_optional() {
        let session: CheckoutSession =
            serde_json::from_value(serde_json::json!({ "id": "cs_2" })).unwrap();
        assert!(!session.is_paid());
        assert!(session.metadata.credits_amount.is_none());
    }
}
