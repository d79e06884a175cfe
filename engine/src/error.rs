//! Error types for the Stow engine.

use thiserror::Error;

/// All possible errors from the Stow engine.
///
/// These are contract violations: the caller handed the engine something it
/// can never store or compile, so retrying the same input will fail the same way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Naming errors
    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("invalid field name: {0:?}")]
    InvalidField(String),

    #[error("field name is reserved: {0}")]
    ReservedField(String),

    #[error("document key must not be empty")]
    EmptyKey,

    // Document errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported value for field '{field}': {reason}")]
    UnsupportedValue { field: String, reason: String },

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Query errors
    #[error("invalid condition on field '{field}': {reason}")]
    InvalidCondition { field: String, reason: String },

    // Sync errors
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("invalid sync log: {0}")]
    InvalidSyncLog(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
