//! Key encoding utilities for `RocksDB`.
//!
//! User ids are variable length, so every user-scoped key starts with a
//! one-byte length followed by the id bytes. That keeps `alice` from being a
//! prefix of `alice2` during index scans.

use nevis_gateway_core::{AttemptId, TransactionId, TransactionKind, UserId};

const ULID_LEN: usize = 16;

/// Length-prefixed user bytes.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> Vec<u8> {
    let bytes = user_id.as_bytes();
    let mut key = Vec::with_capacity(1 + bytes.len());
    // UserId is capped well below 256 bytes.
    #[allow(clippy::cast_possible_truncation)]
    key.push(bytes.len() as u8);
    key.extend_from_slice(bytes);
    key
}

/// Create an account key from a user ID.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_prefix(user_id)
}

/// Create a transaction key from a transaction ID.
#[must_use]
pub fn transaction_key(transaction_id: &TransactionId) -> Vec<u8> {
    transaction_id.to_bytes().to_vec()
}

/// Create a user-transaction index key.
///
/// Since ULIDs are time-ordered, transactions for a user sort by time.
#[must_use]
pub fn user_transaction_key(user_id: &UserId, transaction_id: &TransactionId) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(&transaction_id.to_bytes());
    key
}

/// Create an idempotency index key.
#[must_use]
pub fn idempotency_key(user_id: &UserId, kind: TransactionKind, key: &str) -> Vec<u8> {
    let kind = kind.as_str().as_bytes();
    let user = user_prefix(user_id);
    let mut out = Vec::with_capacity(kind.len() + 1 + user.len() + key.len());
    out.extend_from_slice(kind);
    out.push(0);
    out.extend_from_slice(&user);
    out.extend_from_slice(key.as_bytes());
    out
}

/// Create an attempt key from an attempt ID.
#[must_use]
pub fn attempt_key(attempt_id: &AttemptId) -> Vec<u8> {
    attempt_id.to_bytes().to_vec()
}

/// Create a user-attempt index key.
#[must_use]
pub fn user_attempt_key(user_id: &UserId, attempt_id: &AttemptId) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(&attempt_id.to_bytes());
    key
}

/// Create a payment key from the external session id.
#[must_use]
pub fn payment_key(external_session_id: &str) -> Vec<u8> {
    external_session_id.as_bytes().to_vec()
}

/// Create a request-count key for a user and period (`YYYY-MM`).
#[must_use]
pub fn request_count_key(user_id: &UserId, period: &str) -> Vec<u8> {
    let mut key = user_prefix(user_id);
    key.extend_from_slice(period.as_bytes());
    key
}

/// The greatest index key under `prefix`.
///
/// Index keys are `prefix || ulid`, so seeking backwards from here lands on
/// the newest entry.
#[must_use]
pub fn index_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&[0xFF; ULID_LEN]);
    key
}

/// Read the trailing ULID of a user index key.
///
/// Returns `None` if the key is shorter than a ULID.
#[must_use]
pub fn trailing_ulid(key: &[u8]) -> Option<[u8; ULID_LEN]> {
    let start = key.len().checked_sub(ULID_LEN)?;
    let mut bytes = [0u8; ULID_LEN];
    bytes.copy_from_slice(&key[start..]);
    Some(bytes)
}

/// Decode a transaction id stored as an index value.
#[must_use]
pub fn transaction_id_from_value(value: &[u8]) -> Option<TransactionId> {
    let bytes: [u8; ULID_LEN] = value.try_into().ok()?;
    Some(TransactionId::from_bytes(bytes))
}

/// Decode a big-endian `i64` counter value.
#[must_use]
pub fn i64_from_value(value: &[u8]) -> Option<i64> {
    Some(i64::from_be_bytes(value.try_into().ok()?))
}

/// Decode a big-endian `u32` counter value.
#[must_use]
pub fn u32_from_value(value: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(value.try_into().ok()?))
}
