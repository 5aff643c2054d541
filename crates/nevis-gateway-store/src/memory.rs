//! In-memory storage implementation.
//!
//! Used by the test suites and by deployments that run without a data
//! directory. Nothing survives a restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use nevis_gateway_core::{
    AttemptId, CreditAccount, CreditTransaction, GenerationAttempt, PaymentEvent, TransactionId,
    TransactionKind, UserId,
};

use crate::error::{Result, StoreError};
use crate::{apply_write, CommitOutcome, LedgerWrite, LockTable, Store};

const LOCK_STRIPES: usize = 64;

#[derive(Default)]
struct Tables {
    accounts: HashMap<UserId, CreditAccount>,
    transactions: HashMap<TransactionId, CreditTransaction>,
    transactions_by_user: HashMap<UserId, BTreeMap<TransactionId, ()>>,
    idempotency: HashMap<(UserId, TransactionKind, String), TransactionId>,
    attempts: HashMap<AttemptId, GenerationAttempt>,
    attempts_by_user: HashMap<UserId, BTreeMap<AttemptId, ()>>,
    payments: HashMap<String, PaymentEvent>,
    attempt_costs: HashMap<UserId, i64>,
    request_counts: HashMap<(UserId, String), u32>,
}

/// Process-local storage backed by hash maps.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    locks: LockTable,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            locks: LockTable::new(LOCK_STRIPES),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|e| StoreError::Database(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|e| StoreError::Database(format!("lock poisoned: {e}")))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn page<'a, K: 'a, V: Clone + 'a>(
    ids: impl DoubleEndedIterator<Item = &'a K>,
    rows: &HashMap<K, V>,
    limit: usize,
    offset: usize,
) -> Vec<V>
where
    K: std::hash::Hash + Eq,
{
    ids.rev()
        .skip(offset)
        .take(limit)
        .filter_map(|id| rows.get(id).cloned())
        .collect()
}

impl Store for MemoryStore {
    fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        Ok(self.read()?.accounts.get(user_id).cloned())
    }

    fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome> {
        let user_id = write.transaction.user_id.clone();
        let _guard = self.locks.lock(&user_id);

        let mut tables = self.write()?;

        if let Some(payment) = &write.payment {
            if let Some(existing) = tables.payments.get(&payment.external_session_id) {
                return Ok(CommitOutcome::PaymentAlreadyProcessed {
                    payment: existing.clone(),
                });
            }
        }

        let idem = (
            user_id.clone(),
            write.transaction.kind,
            write.transaction.idempotency_key.clone(),
        );
        if let Some(tx_id) = tables.idempotency.get(&idem) {
            if let Some(existing) = tables.transactions.get(tx_id) {
                return Ok(CommitOutcome::Replayed {
                    transaction: existing.clone(),
                });
            }
        }

        let current = tables.accounts.get(&user_id).cloned();
        let (account, transaction) = apply_write(current, &write)?;

        tables.accounts.insert(user_id.clone(), account.clone());
        tables
            .transactions
            .insert(transaction.id, transaction.clone());
        tables
            .transactions_by_user
            .entry(user_id)
            .or_default()
            .insert(transaction.id, ());
        tables.idempotency.insert(idem, transaction.id);
        if let Some(payment) = write.payment {
            tables
                .payments
                .insert(payment.external_session_id.clone(), payment);
        }

        Ok(CommitOutcome::Applied {
            transaction,
            account,
        })
    }

    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>> {
        Ok(self.read()?.transactions.get(transaction_id).cloned())
    }

    fn find_transaction(
        &self,
        user_id: &UserId,
        kind: TransactionKind,
        idempotency_key: &str,
    ) -> Result<Option<CreditTransaction>> {
        let tables = self.read()?;
        let idem = (user_id.clone(), kind, idempotency_key.to_string());
        Ok(tables
            .idempotency
            .get(&idem)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let tables = self.read()?;
        Ok(tables
            .transactions_by_user
            .get(user_id)
            .map(|ids| page(ids.keys(), &tables.transactions, limit, offset))
            .unwrap_or_default())
    }

    fn put_attempt(&self, attempt: &GenerationAttempt) -> Result<()> {
        let mut tables = self.write()?;
        if tables.attempts.contains_key(&attempt.id) {
            return Err(StoreError::AlreadyExists(attempt.id.to_string()));
        }
        tables.attempts.insert(attempt.id, attempt.clone());
        tables
            .attempts_by_user
            .entry(attempt.user_id.clone())
            .or_default()
            .insert(attempt.id, ());
        if attempt.success {
            *tables
                .attempt_costs
                .entry(attempt.user_id.clone())
                .or_default() += attempt.estimated_cost_usd_micros;
        }
        Ok(())
    }

    fn list_attempts_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationAttempt>> {
        let tables = self.read()?;
        Ok(tables
            .attempts_by_user
            .get(user_id)
            .map(|ids| page(ids.keys(), &tables.attempts, limit, offset))
            .unwrap_or_default())
    }

    fn attempt_cost_usd_micros(&self, user_id: &UserId) -> Result<i64> {
        Ok(self
            .read()?
            .attempt_costs
            .get(user_id)
            .copied()
            .unwrap_or_default())
    }

    fn request_count(&self, user_id: &UserId, period: &str) -> Result<u32> {
        let key = (user_id.clone(), period.to_string());
        Ok(self
            .read()?
            .request_counts
            .get(&key)
            .copied()
            .unwrap_or_default())
    }

    fn increment_request_count(&self, user_id: &UserId, period: &str) -> Result<u32> {
        let mut tables = self.write()?;
        let count = tables
            .request_counts
            .entry((user_id.clone(), period.to_string()))
            .or_default();
        *count = count.saturating_add(1);
        Ok(*count)
    }

    fn get_payment_event(&self, external_session_id: &str) -> Result<Option<PaymentEvent>> {
        Ok(self.read()?.payments.get(external_session_id).cloned())
    }
}
