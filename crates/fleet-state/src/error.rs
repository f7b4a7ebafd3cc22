//! Error types for the inventory store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or expected-state check failed inside a write
    /// transaction. Nothing was committed; callers retry with fresh data.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("capacity exhausted: {0}")]
    Capacity(String),
}

impl StateError {
    /// Whether retrying with freshly read data may succeed.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StateError::ConstraintViolation(_))
    }
}
