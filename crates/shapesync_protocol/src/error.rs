//! Error types for message decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while decoding shape stream messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload is not valid JSON or does not have the message shape.
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),

    /// A field required for the message kind is absent.
    #[error("missing message field: {0}")]
    MissingField(&'static str),

    /// An LSN header could not be read as an unsigned 64-bit integer.
    #[error("invalid lsn: {0}")]
    InvalidLsn(String),
}
