//! Error types for the nodegrid state store.

use thiserror::Error;

use crate::variables::ValueKind;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

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

    #[error("type mismatch for variable {variable}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        variable: &'static str,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("cannot increment variable {variable} of type {actual:?}")]
    IllegalVariableType {
        variable: &'static str,
        actual: ValueKind,
    },

    #[error("invalid delta {delta} for counter {variable}")]
    InvalidDelta { variable: &'static str, delta: i64 },

    #[error("counter {0} overflowed")]
    Overflow(&'static str),
}

impl StateError {
    /// Whether this error came from the storage engine (unreachable store,
    /// lock conflict, failed commit) rather than from a caller mistake.
    ///
    /// Storage errors are the ones an event driver may retry.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            StateError::Open(_)
                | StateError::Transaction(_)
                | StateError::Table(_)
                | StateError::Read(_)
                | StateError::Write(_)
                | StateError::Serialize(_)
                | StateError::Deserialize(_)
        )
    }
}
