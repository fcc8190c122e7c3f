//! Error types and result handling for queue storage operations.
//!
//! Separates transient storage failures (retryable by the caller or the
//! next poll tick) from constraint violations and programmer errors that
//! must not be retried.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and model operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed for a transient reason (connectivity,
    /// timeout). Safe to retry.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation on insert or update. Fatal for the entry in
    /// question; retrying the same write cannot succeed.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input supplied by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Payload could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Whether the failed operation may succeed if retried.
    ///
    /// Only transient database errors qualify; constraint violations and
    /// malformed input are permanent for the entry involved.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
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

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_identified() {
        assert!(CoreError::Database("connection reset".into()).is_transient());
        assert!(!CoreError::ConstraintViolation("duplicate key".into()).is_transient());
        assert!(!CoreError::NotFound("record 7".into()).is_transient());
        assert!(!CoreError::Serialization("bad json".into()).is_transient());
    }

    #[test]
    fn serde_errors_map_to_serialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(CoreError::from(err), CoreError::Serialization(_)));
    }
}
