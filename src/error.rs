use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

use crate::external::ProvisioningError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::DbErr),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Auth error: {0}")]
    AuthError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Insufficient balance")]
    InsufficientBalance,

    #[error("Purchase not actionable: {0}")]
    PurchaseNotActionable(String),

    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(#[from] ProvisioningError),

    #[error("Invariant breach: {0}")]
    InvariantBreach(String),

    #[error("Duplicate payment {provider}/{charge_id}")]
    DuplicatePayment { provider: String, charge_id: String },

    #[error("Orphaned credential {credential_id}: {reason}")]
    OrphanedCredential {
        credential_id: String,
        reason: String,
    },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("JSON serialization/deserialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

impl AppError {
    /// Conditions an operator has to look at by hand.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            AppError::InvariantBreach(_) | AppError::OrphanedCredential { .. }
        )
    }

    /// Failures that left nothing behind and can be retried as a whole.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::ProvisioningFailed(e) => e.is_retryable(),
            AppError::DatabaseError(_) => true,
            _ => false,
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status_code, error_code, message) = match self {
            AppError::ValidationError(msg) => {
                log::warn!("Validation error: {msg}");
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::InvalidAmount(amount) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                format!("Amount must be positive, got {amount}"),
            ),
            AppError::AuthError(msg) => {
                log::warn!("Authentication error: {msg}");
                (StatusCode::UNAUTHORIZED, "AUTH_ERROR", msg.clone())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::InsufficientBalance => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_BALANCE",
                "Insufficient balance, please top up first".to_string(),
            ),
            AppError::PurchaseNotActionable(msg) => {
                (StatusCode::GONE, "PURCHASE_NOT_ACTIONABLE", msg.clone())
            }
            AppError::DuplicatePayment { .. } => {
                log::warn!("{self}");
                (
                    StatusCode::CONFLICT,
                    "DUPLICATE_PAYMENT",
                    "Payment already recorded".to_string(),
                )
            }
            AppError::ProvisioningFailed(err) if self.is_retryable() => {
                log::error!("Provisioning error: {err}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "PROVISIONING_UNAVAILABLE",
                    "Service temporarily unavailable, please try again".to_string(),
                )
            }
            AppError::ProvisioningFailed(err) => {
                log::error!(target: "critical", "Provisioning rejected: {err}");
                (
                    StatusCode::BAD_GATEWAY,
                    "PROVISIONING_REJECTED",
                    "Provisioning rejected the request, please contact support".to_string(),
                )
            }
            _ if self.is_critical() => {
                log::error!(target: "critical", "{self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Something went wrong, please contact support".to_string(),
                )
            }
            AppError::DatabaseError(err) => {
                log::error!("Database error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Database error, please try again".to_string(),
                )
            }
            _ => {
                log::error!("Internal error: {self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Internal server error".to_string(),
                )
            }
        };

        HttpResponse::build(status_code).json(json!({
            "success": false,
            "error": {
                "code": error_code,
                "message": message
            }
        }))
    }
}
