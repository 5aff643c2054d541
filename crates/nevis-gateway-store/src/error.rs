//! Error types for gateway storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Insufficient credits for a deduction.
    #[error("insufficient credits: remaining={remaining}, required={required}")]
    InsufficientCredits {
        /// Credits currently available.
        remaining: i64,
        /// Credits the deduction needs.
        required: i64,
    },

    /// The write would break the balance invariant.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// An immutable record with this id already exists.
    #[error("record already exists: {0}")]
    AlreadyExists(String),
}

impl StoreError {
    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<nevis_gateway_core::GatewayError> for StoreError {
    fn from(err: nevis_gateway_core::GatewayError) -> Self {
        match err {
            nevis_gateway_core::GatewayError::InsufficientCredits { remaining, required } => {
                Self::InsufficientCredits { remaining, required }
            }
            other => Self::InvalidAmount(other.to_string()),
        }
    }
}
