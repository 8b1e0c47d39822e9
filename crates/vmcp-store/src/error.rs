use std::io;
use std::path::PathBuf;

/// Errors from key-value store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A complete log frame failed its integrity check.
    #[error("corrupt log frame at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// The store location is already held by another open handle.
    #[error("store already open: {0}")]
    AlreadyOpen(PathBuf),

    /// A read-only open found no store at this location.
    #[error("no store at {0}")]
    NotFound(PathBuf),

    /// A write was attempted on a store opened read-only.
    #[error("store opened read-only: {0}")]
    ReadOnly(PathBuf),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
