use std::path::PathBuf;

use vmcp_store::StoreError;
use vmcp_types::{Hash, TypeError};

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A hash, key, version, chain or record is absent.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A stored node's recomputed hash does not match the key it is stored
    /// under.
    #[error("hash mismatch: stored under {expected}, content hashes to {computed}")]
    HashMismatch { expected: Hash, computed: Hash },

    /// Persisted data or metadata cannot be decoded or is inconsistent.
    #[error("corrupt checkpoint data: {0}")]
    Corruption(String),

    /// An event-chain step was recorded out of sequence.
    #[error("ordering violation at sequence {seq}: {reason}")]
    OrderingViolation { seq: u64, reason: String },

    /// A caller-supplied key cannot be encoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The storage substrate failed.
    #[error("storage error: {0}")]
    Storage(StoreError),

    /// The storage location is already held by another checkpointer.
    #[error("checkpoint store already open: {0}")]
    AlreadyOpen(PathBuf),

    /// Configuration could not be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl CheckpointError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub(crate) fn ordering(seq: u64, reason: impl Into<String>) -> Self {
        Self::OrderingViolation {
            seq,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Integrity failures: hash mismatches and undecodable data.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::Corruption(_))
    }

    pub fn is_ordering_violation(&self) -> bool {
        matches!(self, Self::OrderingViolation { .. })
    }
}

impl From<StoreError> for CheckpointError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyOpen(path) => Self::AlreadyOpen(path),
            StoreError::Corrupt { .. } => Self::Corruption(err.to_string()),
            StoreError::NotFound(path) => Self::NotFound {
                what: format!("checkpoint store at {}", path.display()),
            },
            other => Self::Storage(other),
        }
    }
}

/// Result alias for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_checkpoint_kinds() {
        let err: CheckpointError = StoreError::AlreadyOpen(PathBuf::from("/tmp/x")).into();
        assert!(matches!(err, CheckpointError::AlreadyOpen(_)));

        let err: CheckpointError = StoreError::Corrupt {
            offset: 8,
            reason: "bad".into(),
        }
        .into();
        assert!(err.is_corruption());

        let err: CheckpointError =
            StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).into();
        assert!(matches!(err, CheckpointError::Storage(StoreError::Io(_))));

        let err: CheckpointError = StoreError::NotFound(PathBuf::from("/tmp/x")).into();
        assert!(err.is_not_found());
    }

    #[test]
    fn predicates() {
        assert!(CheckpointError::not_found("x").is_not_found());
        assert!(CheckpointError::ordering(3, "gap").is_ordering_violation());
        assert!(!CheckpointError::not_found("x").is_corruption());
    }
}
