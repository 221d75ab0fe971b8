//! Error types shared by the repositories and the delivery engine.

use thiserror::Error;

use crate::models::{JobId, WebhookStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Webhook status change that the state machine does not allow.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Status the webhook was in
        from: WebhookStatus,
        /// Status that was requested
        to: WebhookStatus,
    },

    /// The caller no longer holds the lease it is acting on.
    ///
    /// Raised when a lease was released by the stalled sweep, re-leased by
    /// another worker, or invalidated by a dead-letter resurrection.
    #[error("Lease lost for job {job_id}")]
    LeaseLost {
        /// Job whose lease is gone
        job_id: JobId,
    },
}

impl CoreError {
    /// Returns true when the error means the caller's lease is gone.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
