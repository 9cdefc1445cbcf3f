//! Row operations carried by change messages.

use std::fmt;

/// Type of row mutation described by a change message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
    /// An operation this client does not recognise.
    ///
    /// Kept instead of failing decoding so the consumer decides what to do
    /// with it.
    Unknown(String),
}

impl Operation {
    /// Parses the wire name of an operation.
    pub fn from_name(name: &str) -> Self {
        match name {
            "insert" => Operation::Insert,
            "update" => Operation::Update,
            "delete" => Operation::Delete,
            other => Operation::Unknown(other.to_owned()),
        }
    }

    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Unknown(name) => name,
        }
    }

    /// Returns true if this is one of the three known operations.
    pub fn is_known(&self) -> bool {
        !matches!(self, Operation::Unknown(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
