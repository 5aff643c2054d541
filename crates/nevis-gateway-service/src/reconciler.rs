//! Payment reconciler.
//!
//! Turns verified payment events into top-ups. The external session id is
//! both the inbox key and the ledger idempotency key, so redelivered webhooks
//! are acknowledged without touching the balance.

use std::sync::Arc;

use nevis_gateway_core::{GatewayError, PaymentEvent};

use crate::ledger::CreditLedger;

/// What a reconcile call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Credits were added.
    Credited {
        /// Remaining credits after the top-up.
        remaining: i64,
    },
    /// The session was credited by an earlier delivery.
    AlreadyProcessed,
}

/// Applies payment events to the ledger exactly once.
pub struct PaymentReconciler {
    ledger: Arc<CreditLedger>,
}

impl PaymentReconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(ledger: Arc<CreditLedger>) -> Self {
        Self { ledger }
    }

    /// Credit a payment unless its session was already processed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::LedgerStorage`] if storage keeps failing and
    /// [`GatewayError::InvalidAmount`] for non-positive credit amounts.
    pub async fn reconcile(&self, event: PaymentEvent) -> Result<ReconcileOutcome, GatewayError> {
        if self.ledger.payment_processed(&event.external_session_id).await? {
            tracing::info!(
                session_id = %event.external_session_id,
                user_id = %event.user_id,
                "Payment already processed"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        let receipt = self.ledger.apply_payment(&event).await?;
        if !receipt.applied {
            tracing::info!(
                session_id = %event.external_session_id,
                user_id = %event.user_id,
                "Payment processed concurrently by another delivery"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        tracing::info!(
            session_id = %event.external_session_id,
            user_id = %event.user_id,
            plan_id = %event.plan_id,
            credits_added = event.credits_to_add,
            remaining = receipt.remaining,
            "Payment credited"
        );

        Ok(ReconcileOutcome::Credited {
            remaining: receipt.remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nevis_gateway_core::UserId;
    use nevis_gateway_store::MemoryStore;

    use crate::config::RetryPolicy;

    fn reconciler() -> (PaymentReconciler, Arc<CreditLedger>) {
        let ledger = Arc::new(CreditLedger::new(
            Arc::new(MemoryStore::new()),
            RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
            },
            10,
        ));
        (PaymentReconciler::new(Arc::clone(&ledger)), ledger)
    }

    #[tokio::test]
    async fn redelivery_credits_once() {
        let (reconciler, ledger) = reconciler();
        let user = UserId::new("payer").unwrap();
        let event = PaymentEvent::new("cs_live_42", user.clone(), "credits_100", 100, 999);

        assert_eq!(
            reconciler.reconcile(event.clone()).await.unwrap(),
            ReconcileOutcome::Credited { remaining: 110 }
        );
        for _ in 0..5 {
            assert_eq!(
                reconciler.reconcile(event.clone()).await.unwrap(),
                ReconcileOutcome::AlreadyProcessed
            );
        }

        let balance = ledger.balance(&user).await.unwrap();
        assert_eq!(balance.remaining, 110);
        assert_eq!(balance.total, 110);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_credit_once() {
        let (reconciler, ledger) = reconciler();
        let reconciler = Arc::new(reconciler);
        let user = UserId::new("racer").unwrap();
        let event = PaymentEvent::new("cs_live_race", user.clone(), "credits_50", 50, 499);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = Arc::clone(&reconciler);
                let event = event.clone();
                tokio::spawn(async move { reconciler.reconcile(event).await })
            })
            .collect();

        let credited = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(ReconcileOutcome::Credited { .. }))))
            .count();

        assert_eq!(credited, 1);
        assert_eq!(ledger.balance(&user).await.unwrap().remaining, 60);
    }
}
