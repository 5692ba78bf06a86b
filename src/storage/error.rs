//! Store-boundary error type.
//! Maps sqlx and pool failures onto the outcome categories callers act on.

use sqlx::error::ErrorKind;
use thiserror::Error;

use crate::storage::types::EntityKind;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or missing attribute, or an illegal status transition.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// A declared ancestor does not exist.
    #[error("{level} '{key}' does not exist")]
    MissingParent { level: EntityKind, key: String },

    /// The pool could not hand out a connection (timeout, closed, I/O).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A table was used before the connection manager was initialized.
    #[error("connection manager is not initialized")]
    NotInitialized,

    /// A stored column could not be decoded into its record type.
    #[error("corrupt {column} column: {message}")]
    Corrupt { column: String, message: String },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(level: EntityKind, key: impl Into<String>) -> Self {
        StoreError::MissingParent {
            level,
            key: key.into(),
        }
    }

    /// Whether a read that hit this error may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// True when the error was raised before any write reached the store,
    /// or the store rejected the write outright.
    pub fn write_not_applied(&self) -> bool {
        match self {
            StoreError::Validation { .. }
            | StoreError::MissingParent { .. }
            | StoreError::Unavailable(_)
            | StoreError::NotInitialized => true,
            StoreError::Database(sqlx::Error::Database(db)) => matches!(
                db.kind(),
                ErrorKind::UniqueViolation | ErrorKind::CheckViolation | ErrorKind::NotNullViolation
            ),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                StoreError::Unavailable("timed out waiting for a connection".to_string())
            }
            sqlx::Error::PoolClosed => StoreError::Unavailable("pool is closed".to_string()),
            other => StoreError::Database(other),
        }
    }
}
