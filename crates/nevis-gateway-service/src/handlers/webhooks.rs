//! Payment webhook handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use nevis_gateway_core::{PaymentEvent, UserId};

use crate::error::ApiError;
use crate::reconciler::ReconcileOutcome;
use crate::state::AppState;
use crate::stripe::{verify_webhook_signature, CheckoutSession, WebhookEvent, CHECKOUT_SESSION_COMPLETED};

/// Plan recorded when checkout metadata names none.
const DEFAULT_PLAN_ID: &str = "credits";

/// Webhook response.
#[derive(Debug, Default, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was accepted.
    pub received: bool,
    /// Whether this delivery repeated an already processed session.
    pub duplicate: bool,
    /// Credits added by this delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_added: Option<i64>,
    /// Balance after the top-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_credits: Option<i64>,
}

impl WebhookResponse {
    fn acknowledged() -> Self {
        Self {
            received: true,
            ..Self::default()
        }
    }
}

/// `POST /api/webhooks/payment`
///
/// The signature is checked before anything is parsed or credited.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(webhook_secret) = &state.config.stripe_webhook_secret {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::InvalidSignature)?;

        verify_webhook_signature(
            &body,
            signature,
            webhook_secret,
            state.config.stripe_webhook_tolerance_seconds,
            chrono::Utc::now().timestamp(),
        )
        .map_err(|e| {
            tracing::warn!(error = %e, "Invalid payment webhook signature");
            ApiError::InvalidSignature
        })?;
    } else {
        // No webhook_secret configured - skip verification (development mode)
        tracing::warn!("Stripe webhook_secret not configured - skipping signature verification");
    }

    let event: WebhookEvent =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Received payment webhook"
    );

    if event.event_type != CHECKOUT_SESSION_COMPLETED {
        tracing::debug!(event_type = %event.event_type, "Unhandled payment event");
        return Ok(Json(WebhookResponse::acknowledged()));
    }

    let session: CheckoutSession = serde_json::from_value(event.data.object)
        .map_err(|e| ApiError::BadRequest(format!("Invalid checkout session: {e}")))?;

    if !session.is_paid() {
        tracing::info!(
            session_id = %session.id,
            payment_status = ?session.payment_status,
            "Checkout session not paid yet, skipping"
        );
        return Ok(Json(WebhookResponse::acknowledged()));
    }

    let payment = payment_event(session)?;
    let credits = payment.credits_to_add;

    match state.reconciler.reconcile(payment).await? {
        ReconcileOutcome::Credited { remaining } => Ok(Json(WebhookResponse {
            received: true,
            duplicate: false,
            credits_added: Some(credits),
            user_credits: Some(remaining),
        })),
        ReconcileOutcome::AlreadyProcessed => Ok(Json(WebhookResponse {
            received: true,
            duplicate: true,
            ..WebhookResponse::default()
        })),
    }
}

/// Build the payment event from a paid checkout session.
fn payment_event(session: CheckoutSession) -> Result<PaymentEvent, ApiError> {
    let raw_user = session
        .client_reference_id
        .or(session.metadata.user_id)
        .ok_or_else(|| ApiError::BadRequest("Missing client_reference_id".into()))?;
    let user_id = UserId::new(raw_user.as_str())
        .map_err(|_| ApiError::BadRequest(format!("Invalid user_id: {raw_user}")))?;

    let credits = session
        .metadata
        .credits_amount
        .as_deref()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|c| *c > 0)
        .ok_or_else(|| ApiError::BadRequest("Missing or invalid metadata.credits_amount".into()))?;

    let plan_id = session
        .metadata
        .plan_id
        .unwrap_or_else(|| DEFAULT_PLAN_ID.to_string());

    Ok(PaymentEvent::new(
        session.id,
        user_id,
        plan_id,
        credits,
        session.amount_total.unwrap_or(0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripe::CheckoutMetadata;

    fn session() -> CheckoutSession {
        CheckoutSession {
            id: "cs_test_1".into(),
            payment_status: Some("paid".into()),
            amount_total: Some(1999),
            client_reference_id: None,
            metadata: CheckoutMetadata {
                credits_amount: Some("200".into()),
                plan_id: Some("pro".into()),
                user_id: Some("meta_user".into()),
            },
        }
    }

    #[test]
    fn user_falls_back_to_metadata() {
        let event = payment_event(session()).unwrap();
        assert_eq!(event.user_id.as_str(), "meta_user");
        assert_eq!(event.credits_to_add, 200);
        assert_eq!(event.plan_id, "pro");
        assert_eq!(event.amount, 1999);
    }

    #[test]
    fn credits_amount_is_required() {
        let mut session = session();
        session.metadata.credits_amount = Some("-5".into());
        assert!(matches!(payment_event(session), Err(ApiError::BadRequest(_))));
    }
}
