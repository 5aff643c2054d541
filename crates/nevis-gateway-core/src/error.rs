//! Error taxonomy for the gateway.
//!
//! Vendor-specific failures are mapped onto [`ProviderErrorKind`] by the
//! adapters; everything a caller can see is expressed as an [`ErrorKind`].

use serde::{Deserialize, Serialize};

use crate::ids::IdError;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Classified failure of a single provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Credential rejected. Not retried on the same tier.
    Auth,

    /// Rate limit or billing quota hit. Not retried on the same tier.
    QuotaExceeded,

    /// The call did not finish in time. Retried with backoff.
    Timeout,

    /// The provider failed on its side. Retried with backoff.
    ServerError,

    /// The provider cannot serve this request. Not retried.
    Unsupported,
}

impl ProviderErrorKind {
    /// Whether the same tier may be retried after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ServerError)
    }

    /// Map to the caller-visible taxonomy.
    #[must_use]
    pub const fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Auth => ErrorKind::ProviderAuthError,
            Self::QuotaExceeded => ErrorKind::ProviderQuotaExceeded,
            Self::Timeout => ErrorKind::ProviderTimeout,
            Self::ServerError => ErrorKind::ProviderServerError,
            Self::Unsupported => ErrorKind::ProviderUnsupported,
        }
    }

    /// Get the kind name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error kinds surfaced to callers and recorded in audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The user cannot pay for the request.
    InsufficientCredits,
    /// A provider rejected our credentials.
    ProviderAuthError,
    /// A provider quota or rate limit was hit.
    ProviderQuotaExceeded,
    /// A provider call timed out.
    ProviderTimeout,
    /// A provider failed on its side.
    ProviderServerError,
    /// A provider cannot serve the request.
    ProviderUnsupported,
    /// Every tier failed; the deduction was refunded.
    AllProvidersExhausted,
    /// The ledger could not be written.
    LedgerStorageError,
}

impl ErrorKind {
    /// Get the kind name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientCredits => "insufficient_credits",
            Self::ProviderAuthError => "provider_auth_error",
            Self::ProviderQuotaExceeded => "provider_quota_exceeded",
            Self::ProviderTimeout => "provider_timeout",
            Self::ProviderServerError => "provider_server_error",
            Self::ProviderUnsupported => "provider_unsupported",
            Self::AllProvidersExhausted => "all_providers_exhausted",
            Self::LedgerStorageError => "ledger_storage_error",
        }
    }
}

/// Errors that can occur in gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Insufficient credits for the operation.
    #[error("insufficient credits: remaining={remaining}, required={required}")]
    InsufficientCredits {
        /// Credits currently available.
        remaining: i64,
        /// Credits the operation needs.
        required: i64,
    },

    /// Every provider tier failed.
    #[error("all providers exhausted (last error: {last_error:?}, refunded: {refunded})")]
    AllProvidersExhausted {
        /// Classification of the last provider failure, if any call was made.
        last_error: Option<ProviderErrorKind>,
        /// Whether the reserved credits were returned.
        refunded: bool,
    },

    /// A generation request id was already charged by an earlier call.
    #[error("request already processed: {0}")]
    DuplicateRequest(String),

    /// Storage failed after bounded retries.
    #[error("ledger storage error: {0}")]
    LedgerStorage(String),

    /// Invalid amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// The taxonomy entry for this error, when it has one.
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::InsufficientCredits { .. } => Some(ErrorKind::InsufficientCredits),
            Self::AllProvidersExhausted { .. } => Some(ErrorKind::AllProvidersExhausted),
            Self::LedgerStorage(_) => Some(ErrorKind::LedgerStorageError),
            Self::DuplicateRequest(_)
            | Self::InvalidAmount(_)
            | Self::InvalidId(_)
            | Self::Configuration(_) => None,
        }
    }
}
