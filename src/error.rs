/// Unified error types for the fulfillment core
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the service
#[derive(Error, Debug)]
pub enum CoreError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Capability gate failed
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// Account suspended or permanently banned
    #[error("Service restricted: {0}")]
    ServiceRestricted(String),

    /// Balance too low for the requested debit
    #[error("Insufficient funds: {required} required")]
    InsufficientFunds { required: i64 },

    /// Allowance claimed within the cooldown window
    #[error("Cooldown active: next claim at {next_claim_at}")]
    CooldownActive {
        next_claim_at: chrono::DateTime<chrono::Utc>,
    },

    /// Order not in the required status, or ownership mismatch
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown order or account id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requester already has a non-terminal order
    #[error("Duplicate active order: {0}")]
    DuplicateActive(String),

    /// VIP requesting the priority tier it already effectively has
    #[error("Redundant tier: {0}")]
    RedundantTier(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structured error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert CoreError to HTTP response
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            CoreError::Unauthorized(_) => (StatusCode::FORBIDDEN, "Unauthorized", self.to_string()),
            CoreError::ServiceRestricted(_) => {
                (StatusCode::FORBIDDEN, "ServiceRestricted", self.to_string())
            }
            CoreError::InsufficientFunds { .. } => (
                StatusCode::PAYMENT_REQUIRED,
                "InsufficientFunds",
                self.to_string(),
            ),
            CoreError::CooldownActive { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "CooldownActive",
                self.to_string(),
            ),
            CoreError::InvalidState(_) => (StatusCode::CONFLICT, "InvalidState", self.to_string()),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            CoreError::DuplicateActive(_) => {
                (StatusCode::CONFLICT, "DuplicateActive", self.to_string())
            }
            CoreError::RedundantTier(_) => {
                (StatusCode::BAD_REQUEST, "RedundantTier", self.to_string())
            }
            CoreError::Validation(_) => {
                (StatusCode::BAD_REQUEST, "InvalidRequest", self.to_string())
            }
            CoreError::Database(_) | CoreError::Internal(_) | CoreError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
