//! Error types for dirlog
//!
//! This module defines the error type shared by the namespace store,
//! the follower, the compactor and the operator tooling.

use crate::types::ContainerId;
use thiserror::Error;

/// Common result type for dirlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for dirlog
#[derive(Debug, Error)]
pub enum Error {
    // Change log errors
    #[error("change log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid change log header: {0}")]
    InvalidHeader(String),

    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("unknown record type {tag:#04x} at offset {offset}")]
    UnknownRecordType { offset: u64, tag: u8 },

    // Namespace errors
    #[error("container not found: {0}")]
    NotFound(ContainerId),

    #[error("container already exists: {0}")]
    AlreadyExists(ContainerId),

    #[error("store is read-only in replica mode")]
    ReadOnly,

    #[error("invalid state: {0}")]
    InvalidState(String),

    // Compaction errors
    #[error(
        "compaction consistency violation for container {id}: expected offset {expected}, found {actual}"
    )]
    CompactionConsistency {
        id: ContainerId,
        expected: u64,
        actual: u64,
    },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a corrupt record error
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Errors a caller cannot recover from without operator action
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::InvalidHeader(_)
                | Self::CorruptRecord { .. }
                | Self::UnknownRecordType { .. }
                | Self::CompactionConsistency { .. }
        )
    }

    /// Get the errno reported to namespace clients
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
            Self::InvalidState(_) | Self::Configuration(_) => libc::EINVAL,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidHeader(_)
            | Self::CorruptRecord { .. }
            | Self::UnknownRecordType { .. }
            | Self::CompactionConsistency { .. }
            | Self::Serialization(_)
            | Self::Deserialization(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::NotFound(7).is_not_found());
        assert!(!Error::AlreadyExists(7).is_not_found());
    }

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::NotFound(7).errno(), libc::ENOENT);
        assert_eq!(Error::AlreadyExists(7).errno(), libc::EEXIST);
        assert_eq!(Error::ReadOnly.errno(), libc::EROFS);
        assert_eq!(Error::corrupt(64, "bad crc").errno(), libc::EIO);
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::UnknownRecordType { offset: 24, tag: 9 }.is_fatal());
        assert!(
            Error::CompactionConsistency {
                id: 3,
                expected: 24,
                actual: 90
            }
            .is_fatal()
        );
        assert!(!Error::NotFound(1).is_fatal());
    }
}
