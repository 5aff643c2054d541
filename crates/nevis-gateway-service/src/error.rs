//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use nevis_gateway_core::{ErrorKind, GatewayError};
use nevis_gateway_store::StoreError;

use crate::gateway::GenerationFailure;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request id was already charged.
    #[error("duplicate request: {key}")]
    DuplicateRequest {
        /// The reused request id.
        key: String,
        /// Current balance, when known.
        user_credits: Option<i64>,
    },

    /// Webhook signature rejected.
    #[error("invalid signature")]
    InvalidSignature,

    /// Not enough credits; nothing was charged.
    #[error("insufficient credits: remaining={remaining}, required={required}")]
    InsufficientCredits {
        /// Credits available.
        remaining: i64,
        /// Credits the request costs.
        required: i64,
    },

    /// The user's monthly request cap is used up; nothing was charged.
    #[error("monthly quota exceeded: {used}/{limit}")]
    QuotaExceeded {
        /// Successful generations this month.
        used: u32,
        /// Monthly cap.
        limit: u32,
    },

    /// Every provider tier failed.
    #[error("all providers exhausted")]
    AllProvidersExhausted {
        /// Whether the deduction was returned.
        refunded: bool,
        /// Balance after the refund, when known.
        user_credits: Option<i64>,
    },

    /// The ledger could not be read or written.
    #[error("ledger storage error: {0}")]
    LedgerStorage(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error_kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    credits_refunded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_credits: Option<i64>,
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::InvalidSignature => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateRequest { .. } => StatusCode::CONFLICT,
            Self::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::AllProvidersExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::LedgerStorage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable kind reported as `error_kind`.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::DuplicateRequest { .. } => "duplicate_request",
            Self::InvalidSignature => "invalid_signature",
            Self::InsufficientCredits { .. } => ErrorKind::InsufficientCredits.as_str(),
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::AllProvidersExhausted { .. } => ErrorKind::AllProvidersExhausted.as_str(),
            Self::LedgerStorage(_) => ErrorKind::LedgerStorageError.as_str(),
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_kind = self.kind();

        let (message, credits_refunded, user_credits) = match &self {
            Self::Unauthorized => ("Missing or invalid API key".to_string(), None, None),
            Self::BadRequest(msg) | Self::NotFound(msg) => (msg.clone(), None, None),
            Self::DuplicateRequest { key, user_credits } => (
                format!("Request {key} was already processed"),
                None,
                *user_credits,
            ),
            Self::InvalidSignature => ("Invalid webhook signature".to_string(), None, None),
            Self::InsufficientCredits { remaining, required } => (
                format!("Insufficient credits: {remaining} remaining, {required} required"),
                None,
                Some(*remaining),
            ),
            Self::QuotaExceeded { used, limit } => (
                format!("Monthly quota exceeded ({used}/{limit})"),
                None,
                None,
            ),
            Self::AllProvidersExhausted {
                refunded,
                user_credits,
            } => (
                if *refunded {
                    "All AI providers are currently unavailable. Your credits have been refunded."
                        .to_string()
                } else {
                    "All AI providers are currently unavailable.".to_string()
                },
                Some(*refunded),
                *user_credits,
            ),
            // Storage and internal details stay in the logs.
            Self::LedgerStorage(msg) => {
                tracing::error!(error = %msg, "Ledger storage error");
                ("Credit ledger unavailable, please retry".to_string(), None, None)
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                ("An internal error occurred".to_string(), None, None)
            }
        };

        let body = ErrorResponse {
            success: false,
            error_kind,
            message,
            credits_refunded,
            user_credits,
        };

        (status, Json(body)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InsufficientCredits { remaining, required } => {
                Self::InsufficientCredits { remaining, required }
            }
            GatewayError::AllProvidersExhausted { refunded, .. } => Self::AllProvidersExhausted {
                refunded,
                user_credits: None,
            },
            GatewayError::DuplicateRequest(key) => Self::DuplicateRequest {
                key,
                user_credits: None,
            },
            GatewayError::LedgerStorage(msg) => Self::LedgerStorage(msg),
            GatewayError::InvalidAmount(msg) => Self::BadRequest(msg),
            GatewayError::InvalidId(e) => Self::BadRequest(e.to_string()),
            GatewayError::Configuration(msg) => Self::Internal(msg),
        }
    }
}

impl From<GenerationFailure> for ApiError {
    fn from(failure: GenerationFailure) -> Self {
        match failure.error {
            GatewayError::AllProvidersExhausted { refunded, .. } => Self::AllProvidersExhausted {
                refunded,
                user_credits: failure.user_credits,
            },
            GatewayError::DuplicateRequest(key) => Self::DuplicateRequest {
                key,
                user_credits: failure.user_credits,
            },
            other => other.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits { remaining, required } => {
                Self::InsufficientCredits { remaining, required }
            }
            StoreError::InvalidAmount(msg) => Self::BadRequest(msg),
            StoreError::Database(msg)
            | StoreError::Serialization(msg)
            | StoreError::AlreadyExists(msg) => Self::LedgerStorage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nevis_gateway_core::ProviderErrorKind;

    async fn body_json(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn insufficient_credits_is_402_with_balance() {
        let (status, body) = body_json(ApiError::InsufficientCredits {
            remaining: 2,
            required: 3,
        })
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "insufficient_credits");
        assert_eq!(body["user_credits"], 2);
        assert!(body.get("credits_refunded").is_none());
    }

    #[tokio::test]
    async fn exhaustion_reports_refund() {
        let failure = GenerationFailure {
            error: GatewayError::AllProvidersExhausted {
                last_error: Some(ProviderErrorKind::Timeout),
                refunded: true,
            },
            user_credits: Some(10),
        };
        let (status, body) = body_json(failure.into()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error_kind"], "all_providers_exhausted");
        assert_eq!(body["credits_refunded"], true);
        assert_eq!(body["user_credits"], 10);
    }

    #[tokio::test]
    async fn duplicate_request_reports_balance() {
        let failure = GenerationFailure {
            error: GatewayError::DuplicateRequest("req-1".into()),
            user_credits: Some(9),
        };
        let (status, body) = body_json(failure.into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_kind"], "duplicate_request");
        assert_eq!(body["user_credits"], 9);
    }

    #[tokio::test]
    async fn quota_exceeded_is_429() {
        let (status, body) = body_json(ApiError::QuotaExceeded { used: 40, limit: 40 }).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error_kind"], "quota_exceeded");
        assert_eq!(body["message"], "Monthly quota exceeded (40/40)");
    }

    #[tokio::test]
    async fn storage_details_do_not_leak() {
        let (status, body) = body_json(ApiError::LedgerStorage("rocksdb: IO error /data/x".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error_kind"], "ledger_storage_error");
        assert!(!body["message"].as_str().unwrap().contains("rocksdb"));
    }
}
