//! Error types for Strata

use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Caller supplied an unusable key or value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Key does not exist (or was deleted)
    #[error("Key not found")]
    KeyNotFound,

    /// A structural invariant of the tree does not hold
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encoding or decoding of a persisted record failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corruption(_) | StrataError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is a plain miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::KeyNotFound)
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(StrataError::KeyNotFound.is_not_found());
        assert!(!StrataError::KeyNotFound.is_corruption());
        assert!(StrataError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
        assert!(StrataError::Corruption("bad varint".into()).is_corruption());

        let io = StrataError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert!(io.is_retryable());
        assert!(!StrataError::InvalidArgument("empty key".into()).is_retryable());
    }
}
