//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The embedded database reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Positional parameters do not match the statement's placeholders.
    #[error("statement expects {expected} parameters, got {actual}")]
    ParameterCount {
        /// Number of placeholders in the statement.
        expected: usize,
        /// Number of parameters supplied.
        actual: usize,
    },

    /// A named parameter does not appear in the statement.
    #[error("unknown statement parameter: {0}")]
    UnknownParameter(String),

    /// The adapter has been closed.
    #[error("storage is closed")]
    Closed,
}
