//! Error types for the sync engine.

use shapesync_protocol::ProtocolError;
use shapesync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// An error reported by a shape stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Error message.
    pub message: String,
    /// Whether the stream may succeed if retried.
    pub retryable: bool,
}

impl TransportError {
    /// Creates a retryable transport error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A change message that cannot be turned into a statement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// An update or delete is missing one of the primary-key columns.
    #[error("row for table {table} is missing primary key column {column}")]
    MissingPrimaryKey {
        /// Target table.
        table: String,
        /// Missing column.
        column: String,
    },

    /// An insert resolved to a row without columns.
    #[error("insert into table {table} has no columns")]
    EmptyRow {
        /// Target table.
        table: String,
    },
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The table already has an active binding.
    #[error("already syncing table {table}")]
    AlreadySyncing {
        /// The contested table.
        table: String,
    },

    /// More than one persisted state row exists for a key.
    #[error("found {rows} metadata rows for subscription key {key}")]
    Consistency {
        /// Subscription or shape key.
        key: String,
        /// Number of rows found.
        rows: usize,
    },

    /// A change message could not be applied.
    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    /// The storage adapter failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stream message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The shape stream reported an error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persisted metadata could not be read.
    #[error("invalid subscription metadata: {0}")]
    Metadata(String),

    /// The engine has been closed.
    #[error("sync engine is closed")]
    Closed,

    /// The subscription was cancelled.
    #[error("subscription cancelled")]
    Cancelled,

    /// The binding options are invalid.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(e) => e.retryable,
            _ => false,
        }
    }
}
