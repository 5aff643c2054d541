//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Credit accounts, keyed by `user_prefix`.
    pub const ACCOUNTS: &str = "accounts";

    /// Credit transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_prefix || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Idempotency index, keyed by `kind || 0x00 || user_prefix || key`.
    /// Value is the transaction id.
    pub const IDEMPOTENCY: &str = "idempotency";

    /// Generation attempts, keyed by `attempt_id` (ULID).
    pub const ATTEMPTS: &str = "attempts";

    /// Index: attempts by user, keyed by `user_prefix || attempt_id`.
    pub const ATTEMPTS_BY_USER: &str = "attempts_by_user";

    /// Processed payment events, keyed by external session id.
    pub const PAYMENTS: &str = "payments";

    /// Running provider spend per user, keyed by `user_prefix`.
    /// Value is a big-endian `i64` of USD micros.
    pub const ATTEMPT_COSTS: &str = "attempt_costs";

    /// Successful generations per user and month, keyed by
    /// `user_prefix || period`. Value is a big-endian `u32`.
    pub const REQUEST_COUNTS: &str = "request_counts";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::IDEMPOTENCY,
        cf::ATTEMPTS,
        cf::ATTEMPTS_BY_USER,
        cf::PAYMENTS,
        cf::ATTEMPT_COSTS,
        cf::REQUEST_COUNTS,
    ]
}
