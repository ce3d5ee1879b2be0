use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TxError {
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    /// Failure raised by a unit of work itself. Shared so that every clone
    /// of a captured failure points at the same error.
    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

impl TxError {
    /// Returns `true` for conflicts that a fresh attempt may resolve.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, TxError>;

impl<T> From<std::sync::PoisonError<T>> for TxError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<anyhow::Error> for TxError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(Arc::new(err))
    }
}

impl From<serde_json::Error> for TxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
