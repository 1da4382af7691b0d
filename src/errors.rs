use http::StatusCode;
use sea_orm::error::{DbErr, SqlErr};

use crate::entities::order::OrderStatus;
use crate::services::receipt_validator::RejectReason;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request input (empty item list, zero quantity, ...).
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The payment proof was rejected by the validation chain. Callers must
    /// submit a new proof; the core never retries these.
    #[error("Payment proof rejected: {0}")]
    ValidationRejected(RejectReason),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Wraps a database error, turning unique-index violations into a
    /// `Conflict` carrying `context`.
    pub fn from_db_with_conflict(error: DbErr, context: impl Into<String>) -> Self {
        match error.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(detail)) => {
                ServiceError::Conflict(format!("{}: {}", context.into(), detail))
            }
            _ => ServiceError::DatabaseError(error),
        }
    }

    /// Whether the caller may re-read state and retry the operation once.
    ///
    /// Business rejections and invariant violations are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_)
                | Self::InsufficientStock(_)
                | Self::InvalidTransition { .. }
                | Self::ExternalServiceError(_)
        )
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_)
            | Self::InternalError(_)
            | Self::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::ValidationRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) | Self::InsufficientStock(_) | Self::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for user-facing responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::InvariantViolation(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}
