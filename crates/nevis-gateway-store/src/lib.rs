//! Storage layer for the Nevis AI generation gateway.
//!
//! This crate persists credit accounts, the append-only transaction log,
//! generation attempt audit rows and processed payment events.
//!
//! # Atomicity
//!
//! Every balance change goes through [`Store::commit`], which performs the
//! idempotency lookup, the balance check, the account update, the transaction
//! insert and (for payments) the payment-event insert as one unit. Commits for
//! the same user are serialized; commits for different users run in parallel.
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, used by tests and ephemeral deployments.
//! - `RocksStore`: `RocksDB` with column families (feature `rocksdb-backend`).
//!
//! # Example
//!
//! ```
//! use nevis_gateway_core::{CreditTransaction, UserId};
//! use nevis_gateway_store::{CommitOutcome, LedgerWrite, MemoryStore, Store};
//!
//! let store = MemoryStore::new();
//! let user_id = UserId::new("demo_user").unwrap();
//!
//! let grant = CreditTransaction::top_up(user_id.clone(), 10, "signup-grant:demo_user", serde_json::Value::Null);
//! let outcome = store.commit(LedgerWrite::transaction(grant)).unwrap();
//! assert!(matches!(outcome, CommitOutcome::Applied { .. }));
//! assert_eq!(store.get_account(&user_id).unwrap().unwrap().remaining_credits, 10);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use nevis_gateway_core::{
    CreditAccount, CreditTransaction, GenerationAttempt, PaymentEvent, TransactionId,
    TransactionKind, UserId, UserTier,
};

/// A ledger mutation submitted to [`Store::commit`].
#[derive(Debug, Clone)]
pub struct LedgerWrite {
    /// The transaction to append. Its sign and kind decide the balance change.
    pub transaction: CreditTransaction,

    /// Payment event to record in the same unit (top-ups from webhooks).
    pub payment: Option<PaymentEvent>,

    /// Tier the account moves to when this write is applied.
    pub tier: Option<UserTier>,
}

impl LedgerWrite {
    /// A plain transaction with no side records.
    #[must_use]
    pub fn transaction(transaction: CreditTransaction) -> Self {
        Self {
            transaction,
            payment: None,
            tier: None,
        }
    }

    /// A top-up that also marks a payment event as processed.
    #[must_use]
    pub fn payment(transaction: CreditTransaction, payment: PaymentEvent) -> Self {
        let tier = UserTier::from_plan_id(&payment.plan_id);
        Self {
            transaction,
            payment: Some(payment),
            tier,
        }
    }
}

/// Result of a [`Store::commit`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The write was applied.
    Applied {
        /// The stored transaction (with `balance_after` filled in).
        transaction: CreditTransaction,
        /// The account after the write.
        account: CreditAccount,
    },

    /// A transaction with the same `(user, kind, key)` already exists; nothing changed.
    Replayed {
        /// The transaction recorded by the first commit.
        transaction: CreditTransaction,
    },

    /// The payment event was already processed; nothing changed.
    PaymentAlreadyProcessed {
        /// The previously recorded event.
        payment: PaymentEvent,
    },
}

/// The storage trait defining all database operations.
///
/// Implementations must make [`Store::commit`] atomic and serialized per user.
pub trait Store: Send + Sync {
    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>>;

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Apply a ledger write atomically.
    ///
    /// Accounts are created on the first credit. A deduction against a missing
    /// account fails with `InsufficientCredits { remaining: 0, .. }`.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientCredits` if a deduction does not fit.
    /// - `StoreError::InvalidAmount` if the write would break the invariant.
    /// - `StoreError::Database` / `Serialization` on storage failure.
    fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome>;

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>>;

    /// Find the transaction recorded for an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_transaction(
        &self,
        user_id: &UserId,
        kind: TransactionKind,
        idempotency_key: &str,
    ) -> Result<Option<CreditTransaction>>;

    /// List transactions for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;

    // =========================================================================
    // Audit Operations
    // =========================================================================

    /// Append a generation attempt. Attempts are immutable.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the attempt id was already written.
    fn put_attempt(&self, attempt: &GenerationAttempt) -> Result<()>;

    /// List attempts for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_attempts_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationAttempt>>;

    /// Estimated provider spend across a user's successful attempts.
    ///
    /// Kept as a running total updated by [`Store::put_attempt`].
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn attempt_cost_usd_micros(&self, user_id: &UserId) -> Result<i64>;

    // =========================================================================
    // Quota Operations
    // =========================================================================

    /// Number of successful generations recorded for a user in a period.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn request_count(&self, user_id: &UserId, period: &str) -> Result<u32>;

    /// Record one successful generation and return the new count.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn increment_request_count(&self, user_id: &UserId, period: &str) -> Result<u32>;

    // =========================================================================
    // Payment Operations
    // =========================================================================

    /// Get a processed payment event by external session id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_payment_event(&self, external_session_id: &str) -> Result<Option<PaymentEvent>>;
}

/// Apply a write to the current account state.
///
/// Shared by every backend so that they agree on balance semantics. The
/// caller must hold the user's lock and has already ruled out replays.
///
/// # Errors
///
/// Returns `InsufficientCredits` or `InvalidAmount` if the write does not fit.
pub fn apply_write(
    current: Option<CreditAccount>,
    write: &LedgerWrite,
) -> Result<(CreditAccount, CreditTransaction)> {
    let tx = &write.transaction;

    let mut account = match current {
        Some(account) => account,
        None if tx.kind == TransactionKind::Deduction => {
            return Err(StoreError::InsufficientCredits {
                remaining: 0,
                required: tx.credits(),
            });
        }
        None => CreditAccount::new(tx.user_id.clone()),
    };

    match tx.kind {
        TransactionKind::Deduction => account.debit(tx.credits())?,
        TransactionKind::TopUp => account.top_up(tx.credits())?,
        TransactionKind::Refund => account.refund(tx.credits())?,
    }

    if let Some(tier) = write.tier {
        account.tier = tier;
    }

    let mut stored = tx.clone();
    stored.balance_after = account.remaining_credits;

    Ok((account, stored))
}

/// Striped per-user locks.
///
/// Serializes commits for one user without a global lock. Two users may share
/// a stripe, which only costs parallelism.
pub(crate) struct LockTable {
    stripes: Vec<Mutex<()>>,
}

impl LockTable {
    pub(crate) fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock(&self, user_id: &UserId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() as usize) % self.stripes.len();
        // The guarded value is `()`, so a poisoned stripe carries no broken state.
        self.stripes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("apply_user").unwrap()
    }

    #[test]
    fn credit_creates_missing_account() {
        let tx = CreditTransaction::top_up(user(), 10, "grant", serde_json::Value::Null);
        let (account, stored) = apply_write(None, &LedgerWrite::transaction(tx)).unwrap();
        assert_eq!(account.remaining_credits, 10);
        assert_eq!(stored.balance_after, 10);
    }

    #[test]
    fn deduction_needs_an_account() {
        let tx = CreditTransaction::deduction(user(), 1, "req", serde_json::Value::Null);
        let err = apply_write(None, &LedgerWrite::transaction(tx)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientCredits {
                remaining: 0,
                required: 1
            }
        ));
    }

    #[test]
    fn payment_write_upgrades_tier() {
        let tx = CreditTransaction::top_up(user(), 500, "cs_1", serde_json::Value::Null);
        let payment = PaymentEvent::new("cs_1", user(), "pro", 500, 2000);
        let (account, _) = apply_write(None, &LedgerWrite::payment(tx, payment)).unwrap();
        assert_eq!(account.tier, UserTier::Pro);
    }
}
