//! Generation attempt audit rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::{AttemptId, UserId};

/// Value of `provider_tier` when no tier produced content.
pub const EXHAUSTED_TIER: &str = "exhausted";

/// One row per routed generation request, success or failure.
///
/// Written once by the usage recorder and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttempt {
    /// Unique attempt ID.
    pub id: AttemptId,

    /// The user who made the request.
    pub user_id: UserId,

    /// Caller-supplied or derived request fingerprint (the deduction key).
    pub request_fingerprint: String,

    /// Image or text.
    pub request_class: RequestClass,

    /// Tier id that satisfied the request, or [`EXHAUSTED_TIER`].
    pub provider_tier: String,

    /// Provider family of the satisfying tier, if any.
    pub provider: Option<String>,

    /// Credits charged for the request.
    pub cost_credits: i64,

    /// Whether content was produced.
    pub success: bool,

    /// Wall time spent in the router.
    pub latency_ms: u64,

    /// Error kind of the final failure, if any.
    pub error_kind: Option<ErrorKind>,

    /// Total provider calls made across all tiers.
    pub tier_attempts: u32,

    /// Whether the deduction was refunded.
    pub refunded: bool,

    /// Estimated provider-side spend in millionths of a USD.
    pub estimated_cost_usd_micros: i64,

    /// When the attempt finished.
    pub created_at: DateTime<Utc>,
}

impl GenerationAttempt {
    /// Whether this attempt ran out of tiers.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.provider_tier == EXHAUSTED_TIER
    }
}

/// Class of content being generated; each class has its own tier chain and price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Image generation.
    Image,

    /// Text generation.
    Text,
}

impl RequestClass {
    /// Get the class name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Text => "text",
        }
    }
}

impl std::fmt::Display for RequestClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
