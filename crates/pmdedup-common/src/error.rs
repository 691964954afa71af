//! Error types for pmdedup
//!
//! This module defines the common error type used by the entry store,
//! the block devices and the decision engine.

use crate::types::BlockNumber;
use thiserror::Error;

/// Common result type for pmdedup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for pmdedup
#[derive(Debug, Error)]
pub enum Error {
    // Device errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("block allocation failed: all {capacity} blocks in use")]
    AllocationFailed { capacity: u64 },

    #[error("block {blocknr} out of range (max {total})")]
    BlockOutOfRange { blocknr: BlockNumber, total: u64 },

    #[error("block {0} is not allocated")]
    BlockNotAllocated(BlockNumber),

    // Reference errors
    #[error("no entry owns block {0}")]
    UnknownBlock(BlockNumber),

    #[error("block {0} has no live references")]
    NotReferenced(BlockNumber),

    // Metadata errors
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("metadata corruption: {0}")]
    Corruption(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error indicates broken bookkeeping
    ///
    /// Fatal errors must not be retried; the engine state can no longer
    /// be trusted.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::Corruption(_))
    }

    /// Check if the caller may retry once pressure subsides
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::AllocationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::AllocationFailed { capacity: 8 }.is_retryable());
        assert!(!Error::invariant("free list empty").is_retryable());
        assert!(!Error::UnknownBlock(BlockNumber::new(1)).is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::invariant("free list empty").is_fatal());
        assert!(Error::Corruption("bad record".into()).is_fatal());
        assert!(!Error::AllocationFailed { capacity: 8 }.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::BlockOutOfRange {
            blocknr: BlockNumber::new(10),
            total: 4,
        };
        assert_eq!(err.to_string(), "block 10 out of range (max 4)");
    }
}
