//! Error types shared by every store backend.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`KVStore`](crate::KVStore) operations.
///
/// Each failure mode is its own variant so callers can branch on the kind
/// instead of matching message text.
#[derive(Error, Debug)]
pub enum KVStoreError {
    /// The requested key has no association. Only `get` returns this.
    #[error("key not found")]
    NotFound,

    /// The underlying storage medium failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend-imposed size or count limit was hit on write.
    #[error("capacity exceeded: {what} is {size} (max {max})")]
    CapacityExceeded {
        what: &'static str,
        size: usize,
        max: usize,
    },

    /// A backup stream or log record is malformed.
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// A backup stream or store directory was written by an incompatible format version.
    #[error("version mismatch: found {found}, supported {supported}")]
    VersionMismatch { found: u16, supported: u16 },

    /// The backend does not implement an optional capability.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// Exclusive create found an existing store.
    #[error("kvstore already exists at {}", .0.display())]
    KVStoreExists(PathBuf),

    /// Open-existing found no store.
    #[error("kvstore does not exist at {}", .0.display())]
    KVStoreNotExists(PathBuf),

    /// The store has been stopped.
    #[error("kvstore is stopped")]
    Stopped,

    /// A write error left the store out of step with its files; reopen it.
    #[error("kvstore failed and must be reopened: {0}")]
    Failed(String),

    /// The store configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KVStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KVStoreError::NotFound)
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        KVStoreError::CorruptData(msg.into())
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, KVStoreError>;
