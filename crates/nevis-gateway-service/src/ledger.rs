//! Credit ledger.
//!
//! The only code path that changes balances. Every mutation is a single
//! [`Store::commit`] keyed by `(user, kind, idempotency_key)`, so replays are
//! answered from the transaction log instead of being applied twice.
//!
//! Transient storage failures are retried with bounded exponential backoff;
//! once the budget is spent the operation fails with
//! [`GatewayError::LedgerStorage`]. The ledger never fails open.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use nevis_gateway_core::{
    CreditAccount, CreditTransaction, GatewayError, PaymentEvent, TransactionId, TransactionKind,
    UserId, UserTier,
};
use nevis_gateway_store::{CommitOutcome, LedgerWrite, Store, StoreError};

use crate::config::RetryPolicy;

/// Result of a ledger mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    /// `false` when the idempotency key had already been used.
    pub applied: bool,
    /// Remaining credits after the (original) mutation.
    pub remaining: i64,
    /// Why nothing was applied, for replays.
    pub reason: Option<String>,
    /// Transaction recorded for the key.
    pub transaction_id: TransactionId,
}

/// A user's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    /// Credits ever granted or purchased.
    pub total: i64,
    /// Credits consumed, net of refunds.
    pub used: i64,
    /// Credits available.
    pub remaining: i64,
    /// Plan tier.
    pub tier: UserTier,
}

impl From<&CreditAccount> for Balance {
    fn from(account: &CreditAccount) -> Self {
        Self {
            total: account.total_credits,
            used: account.used_credits,
            remaining: account.remaining_credits,
            tier: account.tier,
        }
    }
}

/// Idempotency key of the refund for a deduction key.
#[must_use]
pub fn refund_key(deduction_key: &str) -> String {
    format!("refund:{deduction_key}")
}

fn signup_grant_key(user_id: &UserId) -> String {
    format!("signup-grant:{user_id}")
}

/// Serialized access to per-user credit balances.
pub struct CreditLedger {
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    free_tier_credits: i64,
}

impl CreditLedger {
    /// Create a ledger over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, retry: RetryPolicy, free_tier_credits: i64) -> Self {
        Self {
            store,
            retry,
            free_tier_credits,
        }
    }

    /// Debit `credits` from a user, at most once per `idempotency_key`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InsufficientCredits`] if the balance is too low.
    /// - [`GatewayError::LedgerStorage`] if storage keeps failing.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        credits: i64,
        idempotency_key: &str,
        metadata: serde_json::Value,
    ) -> Result<LedgerReceipt, GatewayError> {
        self.ensure_account(user_id).await?;

        let tx = CreditTransaction::deduction(user_id.clone(), credits, idempotency_key, metadata);
        let outcome = match self.commit(LedgerWrite::transaction(tx)).await {
            Ok(outcome) => outcome,
            Err(GatewayError::InsufficientCredits { remaining, required }) => {
                tracing::warn!(
                    user_id = %user_id,
                    required,
                    remaining,
                    key = %idempotency_key,
                    "Deduction rejected"
                );
                return Err(GatewayError::InsufficientCredits { remaining, required });
            }
            Err(e) => return Err(e),
        };
        let receipt = Self::receipt(outcome);

        if receipt.applied {
            tracing::debug!(
                user_id = %user_id,
                credits,
                remaining = receipt.remaining,
                key = %idempotency_key,
                "Credits deducted"
            );
        }
        Ok(receipt)
    }

    /// Add credits as a top-up or a refund, at most once per `idempotency_key`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::InvalidAmount`] for a deduction kind, a non-positive
    ///   amount or a refund larger than what was used.
    /// - [`GatewayError::LedgerStorage`] if storage keeps failing.
    pub async fn credit(
        &self,
        user_id: &UserId,
        credits: i64,
        kind: TransactionKind,
        idempotency_key: &str,
        metadata: serde_json::Value,
    ) -> Result<LedgerReceipt, GatewayError> {
        if !kind.is_credit() {
            return Err(GatewayError::InvalidAmount(format!(
                "{} cannot add credits",
                kind.as_str()
            )));
        }

        let tx = CreditTransaction::of_kind(kind, user_id.clone(), credits, idempotency_key, metadata);
        let receipt = Self::receipt(self.commit(LedgerWrite::transaction(tx)).await?);

        if receipt.applied {
            tracing::info!(
                user_id = %user_id,
                credits,
                kind = kind.as_str(),
                remaining = receipt.remaining,
                "Credits added"
            );
        }
        Ok(receipt)
    }

    /// Credit a payment and mark it processed in the same atomic write.
    ///
    /// Returns `applied = false` when the session was already processed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidAmount`] for non-positive credit amounts
    /// and [`GatewayError::LedgerStorage`] if storage keeps failing.
    pub async fn apply_payment(&self, payment: &PaymentEvent) -> Result<LedgerReceipt, GatewayError> {
        self.ensure_account(&payment.user_id).await?;

        let tx = CreditTransaction::top_up(
            payment.user_id.clone(),
            payment.credits_to_add,
            payment.external_session_id.clone(),
            json!({
                "source": "payment",
                "plan_id": payment.plan_id,
                "amount": payment.amount,
            }),
        );

        match self.commit(LedgerWrite::payment(tx, payment.clone())).await? {
            CommitOutcome::PaymentAlreadyProcessed { .. } => {
                let remaining = self.balance(&payment.user_id).await?.remaining;
                let transaction_id = self
                    .find(&payment.user_id, TransactionKind::TopUp, &payment.external_session_id)
                    .await?
                    .map_or_else(TransactionId::generate, |tx| tx.id);
                Ok(LedgerReceipt {
                    applied: false,
                    remaining,
                    reason: Some("payment already processed".into()),
                    transaction_id,
                })
            }
            outcome => Ok(Self::receipt(outcome)),
        }
    }

    /// Whether a payment session has already been credited.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::LedgerStorage`] if storage keeps failing.
    pub async fn payment_processed(&self, external_session_id: &str) -> Result<bool, GatewayError> {
        let found = self
            .with_retry("get_payment_event", || self.store.get_payment_event(external_session_id))
            .await?;
        Ok(found.is_some())
    }

    /// Current balance, creating the account with the signup grant if needed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::LedgerStorage`] if storage keeps failing.
    pub async fn balance(&self, user_id: &UserId) -> Result<Balance, GatewayError> {
        let account = self.ensure_account(user_id).await?;
        Ok(Balance::from(&account))
    }

    /// Transactions for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::LedgerStorage`] if storage keeps failing.
    pub async fn transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>, GatewayError> {
        self.with_retry("list_transactions", || {
            self.store.list_transactions_by_user(user_id, limit, offset)
        })
        .await
    }

    /// Whether the deduction recorded under `deduction_key` has been refunded.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::LedgerStorage`] if storage keeps failing.
    pub async fn was_refunded(&self, user_id: &UserId, deduction_key: &str) -> Result<bool, GatewayError> {
        let refund = self
            .find(user_id, TransactionKind::Refund, &refund_key(deduction_key))
            .await?;
        Ok(refund.is_some())
    }

    async fn find(
        &self,
        user_id: &UserId,
        kind: TransactionKind,
        key: &str,
    ) -> Result<Option<CreditTransaction>, GatewayError> {
        self.with_retry("find_transaction", || self.store.find_transaction(user_id, kind, key))
            .await
    }

    /// Load the account, granting free-tier credits the first time a user is seen.
    async fn ensure_account(&self, user_id: &UserId) -> Result<CreditAccount, GatewayError> {
        if let Some(account) = self.load(user_id).await? {
            return Ok(account);
        }

        if self.free_tier_credits <= 0 {
            return Ok(CreditAccount::new(user_id.clone()));
        }

        let grant = CreditTransaction::top_up(
            user_id.clone(),
            self.free_tier_credits,
            signup_grant_key(user_id),
            json!({ "source": "signup_grant" }),
        );

        match self.commit(LedgerWrite::transaction(grant)).await? {
            CommitOutcome::Applied { account, .. } => {
                tracing::info!(
                    user_id = %user_id,
                    credits = self.free_tier_credits,
                    "Created account with signup grant"
                );
                Ok(account)
            }
            // Another request granted first.
            CommitOutcome::Replayed { .. } | CommitOutcome::PaymentAlreadyProcessed { .. } => self
                .load(user_id)
                .await?
                .ok_or_else(|| GatewayError::LedgerStorage(format!("account {user_id} vanished"))),
        }
    }

    async fn load(&self, user_id: &UserId) -> Result<Option<CreditAccount>, GatewayError> {
        self.with_retry("get_account", || self.store.get_account(user_id))
            .await
    }

    async fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome, GatewayError> {
        self.with_retry("commit", || self.store.commit(write.clone()))
            .await
    }

    /// Run a store operation, retrying transient failures with backoff.
    async fn with_retry<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, GatewayError> {
        let mut retry = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    retry += 1;
                    let backoff = self.retry.backoff_for(retry);
                    tracing::warn!(
                        operation,
                        retry,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Ledger storage failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(operation, error = %e, "Ledger storage failed after retries");
                    }
                    return Err(map_store_error(e));
                }
            }
        }
    }

    fn receipt(outcome: CommitOutcome) -> LedgerReceipt {
        match outcome {
            CommitOutcome::Applied { transaction, account } => LedgerReceipt {
                applied: true,
                remaining: account.remaining_credits,
                reason: None,
                transaction_id: transaction.id,
            },
            CommitOutcome::Replayed { transaction } => LedgerReceipt {
                applied: false,
                remaining: transaction.balance_after,
                reason: Some(format!(
                    "idempotency key '{}' already used",
                    transaction.idempotency_key
                )),
                transaction_id: transaction.id,
            },
            CommitOutcome::PaymentAlreadyProcessed { payment } => LedgerReceipt {
                applied: false,
                remaining: 0,
                reason: Some(format!(
                    "payment {} already processed",
                    payment.external_session_id
                )),
                transaction_id: TransactionId::generate(),
            },
        }
    }
}

fn map_store_error(err: StoreError) -> GatewayError {
    match err {
        StoreError::InsufficientCredits { remaining, required } => {
            GatewayError::InsufficientCredits { remaining, required }
        }
        StoreError::InvalidAmount(msg) => GatewayError::InvalidAmount(msg),
        StoreError::Database(msg)
        | StoreError::Serialization(msg)
        | StoreError::AlreadyExists(msg) => GatewayError::LedgerStorage(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use nevis_gateway_core::GenerationAttempt;
    use nevis_gateway_store::MemoryStore;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(1000),
        }
    }

    fn ledger(free: i64) -> CreditLedger {
        CreditLedger::new(Arc::new(MemoryStore::new()), policy(), free)
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[tokio::test]
    async fn first_balance_grants_free_tier_once() {
        let ledger = ledger(10);
        let alice = user("alice");

        let balance = ledger.balance(&alice).await.unwrap();
        assert_eq!(balance.remaining, 10);
        assert_eq!(balance.total, 10);
        assert_eq!(balance.tier, UserTier::Free);

        ledger.balance(&alice).await.unwrap();
        let txs = ledger.transactions(&alice, 50, 0).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::TopUp);
        assert_eq!(txs[0].idempotency_key, "signup-grant:alice");
    }

    #[tokio::test]
    async fn deduction_replay_returns_original_receipt() {
        let ledger = ledger(10);
        let bob = user("bob");

        let first = ledger.deduct(&bob, 3, "req-1", json!({})).await.unwrap();
        assert!(first.applied);
        assert_eq!(first.remaining, 7);

        let replay = ledger.deduct(&bob, 3, "req-1", json!({})).await.unwrap();
        assert!(!replay.applied);
        assert_eq!(replay.remaining, 7);
        assert_eq!(replay.transaction_id, first.transaction_id);
        assert!(replay.reason.is_some());

        assert_eq!(ledger.balance(&bob).await.unwrap().remaining, 7);
    }

    #[tokio::test]
    async fn insufficient_credits_leaves_balance_alone() {
        let ledger = ledger(2);
        let carol = user("carol");

        let err = ledger.deduct(&carol, 3, "req-1", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InsufficientCredits {
                remaining: 2,
                required: 3
            }
        ));
        assert_eq!(ledger.balance(&carol).await.unwrap().remaining, 2);
        assert_eq!(ledger.transactions(&carol, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refund_applies_once() {
        let ledger = ledger(10);
        let dave = user("dave");

        ledger.deduct(&dave, 3, "req-9", json!({})).await.unwrap();
        let key = refund_key("req-9");
        let first = ledger
            .credit(&dave, 3, TransactionKind::Refund, &key, json!({}))
            .await
            .unwrap();
        let second = ledger
            .credit(&dave, 3, TransactionKind::Refund, &key, json!({}))
            .await
            .unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        let balance = ledger.balance(&dave).await.unwrap();
        assert_eq!(balance.remaining, 10);
        assert_eq!(balance.used, 0);
    }

    #[tokio::test]
    async fn credit_rejects_deduction_kind() {
        let ledger = ledger(10);
        let err = ledger
            .credit(&user("erin"), 5, TransactionKind::Deduction, "k", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn payment_credits_once_and_sets_tier() {
        let ledger = ledger(10);
        let frank = user("frank");
        let payment = PaymentEvent::new("cs_test_1", frank.clone(), "pro", 100, 999);

        let first = ledger.apply_payment(&payment).await.unwrap();
        assert!(first.applied);
        assert_eq!(first.remaining, 110);

        let again = ledger.apply_payment(&payment).await.unwrap();
        assert!(!again.applied);
        assert_eq!(again.remaining, 110);
        assert_eq!(again.transaction_id, first.transaction_id);

        assert!(ledger.payment_processed("cs_test_1").await.unwrap());
        assert_eq!(ledger.balance(&frank).await.unwrap().tier, UserTier::Pro);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deductions_never_overdraw() {
        let ledger = Arc::new(ledger(3));
        let grace = user("grace");
        ledger.balance(&grace).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let grace = grace.clone();
                tokio::spawn(async move { ledger.deduct(&grace, 3, &format!("req-{i}"), json!({})).await })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let succeeded = results
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter(Result::is_ok)
            .count();

        assert_eq!(succeeded, 1);
        let balance = ledger.balance(&grace).await.unwrap();
        assert_eq!(balance.remaining, 0);
        assert_eq!(balance.total - balance.used, balance.remaining);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deductions_refunds_and_top_ups_stay_consistent() {
        let ledger = Arc::new(ledger(6));
        let judy = user("judy");
        for i in 0..3 {
            ledger.deduct(&judy, 2, &format!("pre-{i}"), json!({})).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..12 {
            let ledger = Arc::clone(&ledger);
            let judy = judy.clone();
            handles.push(tokio::spawn(async move {
                ledger.deduct(&judy, 3, &format!("req-{i}"), json!({})).await.is_ok()
            }));
        }
        for i in 0..6 {
            let ledger = Arc::clone(&ledger);
            let judy = judy.clone();
            handles.push(tokio::spawn(async move {
                let key = refund_key(&format!("pre-{}", i % 3));
                ledger
                    .credit(&judy, 2, TransactionKind::Refund, &key, json!({}))
                    .await
                    .unwrap();
                false
            }));
        }
        for i in 0..4 {
            let ledger = Arc::clone(&ledger);
            let judy = judy.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .credit(&judy, 3, TransactionKind::TopUp, &format!("pack-{i}"), json!({}))
                    .await
                    .unwrap();
                false
            }));
        }

        let deducted = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter(|applied| *applied)
            .count();

        let balance = ledger.balance(&judy).await.unwrap();
        let spent = 3 * i64::try_from(deducted).unwrap();
        assert!(balance.remaining >= 0);
        assert_eq!(balance.total, 18);
        assert_eq!(balance.used, spent);
        assert_eq!(balance.remaining, balance.total - balance.used);
        for i in 0..3 {
            assert!(ledger.was_refunded(&judy, &format!("pre-{i}")).await.unwrap());
        }
        assert!(!ledger.was_refunded(&judy, "req-0").await.unwrap());
    }

    /// Fails the first `failures` commits with a transient error.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl Store for FlakyStore {
        fn get_account(&self, user_id: &UserId) -> nevis_gateway_store::Result<Option<CreditAccount>> {
            self.inner.get_account(user_id)
        }

        fn commit(&self, write: LedgerWrite) -> nevis_gateway_store::Result<CommitOutcome> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Database("disk busy".into()));
            }
            self.inner.commit(write)
        }

        fn get_transaction(&self, id: &TransactionId) -> nevis_gateway_store::Result<Option<CreditTransaction>> {
            self.inner.get_transaction(id)
        }

        fn find_transaction(
            &self,
            user_id: &UserId,
            kind: TransactionKind,
            key: &str,
        ) -> nevis_gateway_store::Result<Option<CreditTransaction>> {
            self.inner.find_transaction(user_id, kind, key)
        }

        fn list_transactions_by_user(
            &self,
            user_id: &UserId,
            limit: usize,
            offset: usize,
        ) -> nevis_gateway_store::Result<Vec<CreditTransaction>> {
            self.inner.list_transactions_by_user(user_id, limit, offset)
        }

        fn put_attempt(&self, attempt: &GenerationAttempt) -> nevis_gateway_store::Result<()> {
            self.inner.put_attempt(attempt)
        }

        fn list_attempts_by_user(
            &self,
            user_id: &UserId,
            limit: usize,
            offset: usize,
        ) -> nevis_gateway_store::Result<Vec<GenerationAttempt>> {
            self.inner.list_attempts_by_user(user_id, limit, offset)
        }

        fn attempt_cost_usd_micros(&self, user_id: &UserId) -> nevis_gateway_store::Result<i64> {
            self.inner.attempt_cost_usd_micros(user_id)
        }

        fn request_count(&self, user_id: &UserId, period: &str) -> nevis_gateway_store::Result<u32> {
            self.inner.request_count(user_id, period)
        }

        fn increment_request_count(&self, user_id: &UserId, period: &str) -> nevis_gateway_store::Result<u32> {
            self.inner.increment_request_count(user_id, period)
        }

        fn get_payment_event(&self, id: &str) -> nevis_gateway_store::Result<Option<PaymentEvent>> {
            self.inner.get_payment_event(id)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_storage_failures_are_retried() {
        let ledger = CreditLedger::new(Arc::new(FlakyStore::new(2)), policy(), 10);
        let balance = ledger.balance(&user("heidi")).await.unwrap();
        assert_eq!(balance.remaining, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_storage_failure_is_fatal() {
        let ledger = CreditLedger::new(Arc::new(FlakyStore::new(100)), policy(), 10);
        let err = ledger
            .deduct(&user("ivan"), 1, "req-1", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::LedgerStorage(_)));
    }
}
