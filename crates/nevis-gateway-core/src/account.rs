//! Credit account types.
//!
//! A [`CreditAccount`] is the authoritative balance row for a user. It is only
//! ever mutated through the ledger, which applies the helpers below inside the
//! store's atomic commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::UserId;

/// Default number of credits granted to a new account.
pub const DEFAULT_FREE_TIER_CREDITS: i64 = 10;

/// A per-user credit balance.
///
/// Invariant: `remaining_credits == total_credits - used_credits` and
/// `remaining_credits >= 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    /// The user this account belongs to.
    pub user_id: UserId,

    /// Plan tier of the user.
    pub tier: UserTier,

    /// Credits ever granted or purchased.
    pub total_credits: i64,

    /// Credits consumed by generation requests (net of refunds).
    pub used_credits: i64,

    /// Credits still available.
    pub remaining_credits: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Create an empty account.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            tier: UserTier::Free,
            total_credits: 0,
            used_credits: 0,
            remaining_credits: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the account can pay for `credits`.
    #[must_use]
    pub fn has_sufficient_credits(&self, credits: i64) -> bool {
        self.remaining_credits >= credits
    }

    /// Consume `credits` from the balance.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InsufficientCredits`] if the balance is too low
    /// and [`GatewayError::InvalidAmount`] for non-positive amounts.
    pub fn debit(&mut self, credits: i64) -> Result<()> {
        ensure_positive(credits)?;
        if !self.has_sufficient_credits(credits) {
            return Err(GatewayError::InsufficientCredits {
                remaining: self.remaining_credits,
                required: credits,
            });
        }
        self.used_credits += credits;
        self.sync_remaining();
        Ok(())
    }

    /// Add purchased or granted credits.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidAmount`] for non-positive amounts.
    pub fn top_up(&mut self, credits: i64) -> Result<()> {
        ensure_positive(credits)?;
        self.total_credits = self
            .total_credits
            .checked_add(credits)
            .ok_or_else(|| GatewayError::InvalidAmount("credit total overflow".into()))?;
        self.sync_remaining();
        Ok(())
    }

    /// Give back credits previously consumed by a deduction.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidAmount`] if the refund exceeds what was
    /// used or is non-positive.
    pub fn refund(&mut self, credits: i64) -> Result<()> {
        ensure_positive(credits)?;
        if credits > self.used_credits {
            return Err(GatewayError::InvalidAmount(format!(
                "refund of {credits} exceeds used credits {}",
                self.used_credits
            )));
        }
        self.used_credits -= credits;
        self.sync_remaining();
        Ok(())
    }

    /// Whether the balance invariant currently holds.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.remaining_credits == self.total_credits - self.used_credits
            && self.remaining_credits >= 0
    }

    fn sync_remaining(&mut self) {
        self.remaining_credits = self.total_credits - self.used_credits;
        self.updated_at = Utc::now();
    }
}

fn ensure_positive(credits: i64) -> Result<()> {
    if credits <= 0 {
        return Err(GatewayError::InvalidAmount(format!(
            "credit amount must be positive, got {credits}"
        )));
    }
    Ok(())
}

/// User plan tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    /// Free tier, starts with the signup grant only.
    #[default]
    Free,

    /// Paying user on the Pro plan.
    Pro,

    /// Enterprise agreement.
    Enterprise,
}

impl UserTier {
    /// Get the tier name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Map a payment plan identifier to the tier it unlocks.
    ///
    /// Credit packs that are not subscription plans return `None`.
    #[must_use]
    pub fn from_plan_id(plan_id: &str) -> Option<Self> {
        match plan_id.to_ascii_lowercase().as_str() {
            "pro" | "plan_pro" | "pro_monthly" => Some(Self::Pro),
            "enterprise" | "plan_enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}
