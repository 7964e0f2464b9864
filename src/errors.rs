use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard JSON error body returned to HTTP callers.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// Error taxonomy for the reconciliation core.
///
/// `AlreadyCaptured` is normally consumed inside the engine: a provider-level
/// "already captured" response is translated into a caller-level success once
/// the re-queried status confirms completion. It only surfaces as an error
/// when that confirmation cannot be obtained.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Payment provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("Payment provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Intent {0} already captured")]
    AlreadyCaptured(String),

    #[error("Amount mismatch on order {order_id}: expected {expected}, got {actual}")]
    AmountMismatch {
        order_id: Uuid,
        expected: rust_decimal::Decimal,
        actual: rust_decimal::Decimal,
    },

    #[error("Concurrent update lost on order {0}")]
    ConcurrentUpdateLost(Uuid),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::AmountMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::AlreadyCaptured(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ProviderRejected(_) => StatusCode::BAD_GATEWAY,
            Self::ProviderUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConcurrentUpdateLost(_) => StatusCode::CONFLICT,
            Self::DatabaseError(_) | Self::InternalError(_) | Self::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message suitable for HTTP responses. Internal errors return generic
    /// text to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}
