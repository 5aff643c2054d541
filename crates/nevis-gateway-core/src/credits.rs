//! Credit transaction types.
//!
//! Every committed ledger mutation appends one [`CreditTransaction`]. Rows are
//! never updated or deleted; `(user_id, kind, idempotency_key)` is unique.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TransactionId, UserId};

/// A committed balance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Signed amount. Positive = credit, negative = debit.
    pub amount: i64,

    /// Kind of mutation.
    pub kind: TransactionKind,

    /// Caller- or event-supplied key making the mutation at-most-once.
    pub idempotency_key: String,

    /// Remaining credits right after this transaction was applied.
    pub balance_after: i64,

    /// Additional context (request fingerprint, session id, tier, ...).
    pub metadata: serde_json::Value,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Create a deduction. The stored amount is always negative.
    #[must_use]
    pub fn deduction(
        user_id: UserId,
        credits: i64,
        idempotency_key: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self::new(user_id, -credits.abs(), TransactionKind::Deduction, idempotency_key, metadata)
    }

    /// Create a top-up (purchase or grant).
    #[must_use]
    pub fn top_up(
        user_id: UserId,
        credits: i64,
        idempotency_key: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self::new(user_id, credits.abs(), TransactionKind::TopUp, idempotency_key, metadata)
    }

    /// Create a refund of a previous deduction.
    #[must_use]
    pub fn refund(
        user_id: UserId,
        credits: i64,
        idempotency_key: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self::new(user_id, credits.abs(), TransactionKind::Refund, idempotency_key, metadata)
    }

    /// Create a transaction of the given kind; the sign follows the kind.
    #[must_use]
    pub fn of_kind(
        kind: TransactionKind,
        user_id: UserId,
        credits: i64,
        idempotency_key: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        match kind {
            TransactionKind::Deduction => Self::deduction(user_id, credits, idempotency_key, metadata),
            TransactionKind::TopUp => Self::top_up(user_id, credits, idempotency_key, metadata),
            TransactionKind::Refund => Self::refund(user_id, credits, idempotency_key, metadata),
        }
    }

    fn new(
        user_id: UserId,
        amount: i64,
        kind: TransactionKind,
        idempotency_key: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount,
            kind,
            idempotency_key: idempotency_key.into(),
            balance_after: 0,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Absolute number of credits moved by this transaction.
    #[must_use]
    pub fn credits(&self) -> i64 {
        self.amount.abs()
    }
}

/// Kind of credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits consumed by a generation request.
    Deduction,

    /// Credits purchased or granted.
    TopUp,

    /// Credits returned after a failed generation.
    Refund,
}

impl TransactionKind {
    /// Get the kind name as a string (also used in storage keys).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deduction => "deduction",
            Self::TopUp => "top_up",
            Self::Refund => "refund",
        }
    }

    /// Check if this kind adds credits.
    #[must_use]
    pub const fn is_credit(&self) -> bool {
        matches!(self, Self::TopUp | Self::Refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("tx_user").unwrap()
    }

    #[test]
    fn deduction_is_negative() {
        let tx = CreditTransaction::deduction(user(), 3, "req-1", serde_json::Value::Null);
        assert_eq!(tx.amount, -3);
        assert_eq!(tx.credits(), 3);
        assert_eq!(tx.kind, TransactionKind::Deduction);
    }

    #[test]
    fn refund_and_top_up_are_positive() {
        let refund = CreditTransaction::refund(user(), -3, "refund:req-1", serde_json::Value::Null);
        assert_eq!(refund.amount, 3);

        let top_up = CreditTransaction::of_kind(
            TransactionKind::TopUp,
            user(),
            100,
            "cs_test_1",
            serde_json::json!({"plan_id": "credits_100"}),
        );
        assert_eq!(top_up.amount, 100);
        assert_eq!(top_up.kind, TransactionKind::TopUp);
    }

    #[test]
    fn kind_credit_debit() {
        assert!(TransactionKind::TopUp.is_credit());
        assert!(TransactionKind::Refund.is_credit());
        assert!(!TransactionKind::Deduction.is_credit());
        assert_eq!(TransactionKind::TopUp.as_str(), "top_up");
    }
}
