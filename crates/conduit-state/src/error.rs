//! Error types for the Conduit state store.

use std::fmt;

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Which redb step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    Open,
    Transaction,
    Table,
    Read,
    Write,
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageOp::Open => "open",
            StorageOp::Transaction => "transaction",
            StorageOp::Table => "table access",
            StorageOp::Read => "read",
            StorageOp::Write => "write",
        })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    /// The embedded database itself failed.
    #[error("state database {op} failed: {detail}")]
    Storage { op: StorageOp, detail: String },

    #[error("cannot encode record: {0}")]
    Encode(String),

    /// A stored value no longer decodes as the record type.
    #[error("corrupt stored record: {0}")]
    Corrupt(String),

    /// Create of a key that is already present.
    #[error("{0} already exists")]
    AlreadyExists(String),
}
