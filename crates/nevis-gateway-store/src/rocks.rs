//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! Compound writes go through a single `WriteBatch` while the user's stripe
//! lock is held, so the read-check-write of a commit cannot interleave with
//! another commit for the same user.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use nevis_gateway_core::{
    AttemptId, CreditAccount, CreditTransaction, GenerationAttempt, PaymentEvent, TransactionId,
    TransactionKind, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{apply_write, CommitOutcome, LedgerWrite, LockTable, Store};

const LOCK_STRIPES: usize = 256;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    locks: LockTable,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            locks: LockTable::new(LOCK_STRIPES),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Collect the trailing ULIDs of an index under `prefix`, newest first.
    ///
    /// Walks the index backwards from its newest key and stops as soon as the
    /// page is full.
    fn scan_index(
        &self,
        cf_name: &str,
        prefix: &[u8],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<[u8; 16]>> {
        let cf = self.cf(cf_name)?;
        let upper = keys::index_upper_bound(prefix);
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(upper.as_slice(), Direction::Reverse));

        let mut ids = Vec::new();
        let mut skipped = 0;
        for item in iter {
            if ids.len() >= limit {
                break;
            }
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if let Some(id) = keys::trailing_ulid(&key[prefix.len()..]) {
                ids.push(id);
            }
        }

        Ok(ids)
    }

    fn get_counter(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn malformed(what: &str) -> StoreError {
    StoreError::Serialization(format!("malformed {what} counter"))
}

impl Store for RocksStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        self.get_value(cf::ACCOUNTS, &keys::account_key(user_id))
    }

    // =========================================================================
    // Ledger Operations
    // =========================================================================

    fn commit(&self, write: LedgerWrite) -> Result<CommitOutcome> {
        let user_id = write.transaction.user_id.clone();
        let _guard = self.locks.lock(&user_id);

        if let Some(payment) = &write.payment {
            if let Some(existing) = self.get_payment_event(&payment.external_session_id)? {
                return Ok(CommitOutcome::PaymentAlreadyProcessed { payment: existing });
            }
        }

        if let Some(existing) = self.find_transaction(
            &user_id,
            write.transaction.kind,
            &write.transaction.idempotency_key,
        )? {
            return Ok(CommitOutcome::Replayed {
                transaction: existing,
            });
        }

        let current = self.get_account(&user_id)?;
        let (account, transaction) = apply_write(current, &write)?;

        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let cf_idem = self.cf(cf::IDEMPOTENCY)?;

        let account_value = Self::serialize(&account)?;
        let tx_value = Self::serialize(&transaction)?;

        // Write atomically
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_accounts, keys::account_key(&user_id), &account_value);
        batch.put_cf(&cf_tx, keys::transaction_key(&transaction.id), &tx_value);
        batch.put_cf(
            &cf_tx_by_user,
            keys::user_transaction_key(&user_id, &transaction.id),
            [],
        );
        batch.put_cf(
            &cf_idem,
            keys::idempotency_key(&user_id, transaction.kind, &transaction.idempotency_key),
            transaction.id.to_bytes(),
        );

        if let Some(payment) = &write.payment {
            let cf_payments = self.cf(cf::PAYMENTS)?;
            batch.put_cf(
                &cf_payments,
                keys::payment_key(&payment.external_session_id),
                Self::serialize(payment)?,
            );
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(CommitOutcome::Applied {
            transaction,
            account,
        })
    }

    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>> {
        self.get_value(cf::TRANSACTIONS, &keys::transaction_key(transaction_id))
    }

    fn find_transaction(
        &self,
        user_id: &UserId,
        kind: TransactionKind,
        idempotency_key: &str,
    ) -> Result<Option<CreditTransaction>> {
        let cf = self.cf(cf::IDEMPOTENCY)?;
        let value = self
            .db
            .get_cf(&cf, keys::idempotency_key(user_id, kind, idempotency_key))
            .map_err(|e| StoreError::Database(e.to_string()))?;

        match value {
            None => Ok(None),
            Some(raw) => {
                let tx_id = keys::transaction_id_from_value(&raw).ok_or_else(|| {
                    StoreError::Serialization("malformed idempotency entry".to_string())
                })?;
                self.get_transaction(&tx_id)
            }
        }
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let prefix = keys::user_prefix(user_id);
        let mut transactions = Vec::new();
        for raw in self.scan_index(cf::TRANSACTIONS_BY_USER, &prefix, limit, offset)? {
            if let Some(tx) = self.get_transaction(&TransactionId::from_bytes(raw))? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    // =========================================================================
    // Audit Operations
    // =========================================================================

    fn put_attempt(&self, attempt: &GenerationAttempt) -> Result<()> {
        let _guard = self.locks.lock(&attempt.user_id);

        let cf_attempts = self.cf(cf::ATTEMPTS)?;
        let cf_by_user = self.cf(cf::ATTEMPTS_BY_USER)?;
        let key = keys::attempt_key(&attempt.id);

        let exists = self
            .db
            .get_cf(&cf_attempts, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if exists {
            return Err(StoreError::AlreadyExists(attempt.id.to_string()));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_attempts, &key, Self::serialize(attempt)?);
        batch.put_cf(
            &cf_by_user,
            keys::user_attempt_key(&attempt.user_id, &attempt.id),
            [],
        );
        if attempt.success {
            // Same stripe lock as the read above, so the total cannot lose an update.
            let total = self
                .attempt_cost_usd_micros(&attempt.user_id)?
                .saturating_add(attempt.estimated_cost_usd_micros);
            let cf_costs = self.cf(cf::ATTEMPT_COSTS)?;
            batch.put_cf(
                &cf_costs,
                keys::account_key(&attempt.user_id),
                total.to_be_bytes(),
            );
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_attempts_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationAttempt>> {
        let prefix = keys::user_prefix(user_id);
        let mut attempts = Vec::new();
        for raw in self.scan_index(cf::ATTEMPTS_BY_USER, &prefix, limit, offset)? {
            let key = keys::attempt_key(&AttemptId::from_bytes(raw));
            if let Some(attempt) = self.get_value(cf::ATTEMPTS, &key)? {
                attempts.push(attempt);
            }
        }
        Ok(attempts)
    }

    fn attempt_cost_usd_micros(&self, user_id: &UserId) -> Result<i64> {
        match self.get_counter(cf::ATTEMPT_COSTS, &keys::account_key(user_id))? {
            None => Ok(0),
            Some(raw) => keys::i64_from_value(&raw).ok_or_else(|| malformed("attempt cost")),
        }
    }

    // =========================================================================
    // Quota Operations
    // =========================================================================

    fn request_count(&self, user_id: &UserId, period: &str) -> Result<u32> {
        match self.get_counter(cf::REQUEST_COUNTS, &keys::request_count_key(user_id, period))? {
            None => Ok(0),
            Some(raw) => keys::u32_from_value(&raw).ok_or_else(|| malformed("request")),
        }
    }

    fn increment_request_count(&self, user_id: &UserId, period: &str) -> Result<u32> {
        let _guard = self.locks.lock(user_id);

        let count = self.request_count(user_id, period)?.saturating_add(1);
        let cf = self.cf(cf::REQUEST_COUNTS)?;
        self.db
            .put_cf(&cf, keys::request_count_key(user_id, period), count.to_be_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(count)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    fn get_payment_event(&self, external_session_id: &str) -> Result<Option<PaymentEvent>> {
        self.get_value(cf::PAYMENTS, &keys::payment_key(external_session_id))
    }
}
