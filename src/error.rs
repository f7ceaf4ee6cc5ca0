// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for tape streams, the command server and replication.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `InvalidArgument` | No | Caller input rejected before any I/O |
//! | `CorruptRecord` | No | Marker, length or hash mismatch while decoding |
//! | `ConcurrencyConflict` | Yes | Strict append condition not met |
//! | `PeerUnavailable` | Yes | Remote unreachable, timed out, or circuit open |
//! | `Protocol` | No | Malformed frame sequence or unexpected reply |
//! | `Io` | Yes | Local medium I/O failure |
//! | `StoreLocked` | No | Another server owns the storage root |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Component is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Rejections Are Not Errors
//!
//! A failed optimistic-concurrency check in
//! [`TapeStream::try_append`](crate::tape::TapeStream::try_append) is an
//! ordinary outcome and is reported as version `0`. Only callers that demand
//! strict enforcement see [`TapeError::ConcurrencyConflict`], via
//! [`AppendCondition::enforce`](crate::types::AppendCondition::enforce).

use thiserror::Error;

/// Result type alias for tape operations.
pub type Result<T> = std::result::Result<T, TapeError>;

/// Errors that can occur while storing, serving or replicating tape streams.
#[derive(Error, Debug)]
pub enum TapeError {
    /// Malformed caller input (empty payload, zero bounds, version overflow).
    ///
    /// Always raised before the medium is touched. Not retryable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A record failed integrity verification.
    ///
    /// `offset` is the byte position where the damaged record starts.
    /// Fatal for the read that hit it; nothing is repaired automatically.
    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    /// The stream version did not match a strictly enforced condition.
    #[error("Concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// Remote peer unreachable or did not answer within the receive timeout.
    #[error("Peer unavailable ({peer}): {message}")]
    PeerUnavailable { peer: String, message: String },

    /// Unknown command, malformed frame sequence or unexpected reply shape.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Local I/O failure on the storage medium.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage root is already owned by another server process.
    #[error("Store locked: {path}")]
    StoreLocked { path: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TapeError {
    /// Shorthand for [`TapeError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Shorthand for [`TapeError::CorruptRecord`].
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }

    /// Shorthand for [`TapeError::PeerUnavailable`].
    pub fn unavailable(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PeerUnavailable {
            peer: peer.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PeerUnavailable { .. } => true,
            Self::ConcurrencyConflict { .. } => true, // re-read version and retry
            Self::Io(_) => true,
            Self::InvalidArgument(_) => false,
            Self::CorruptRecord { .. } => false, // data is damaged at rest
            Self::Protocol(_) => false,
            Self::StoreLocked { .. } => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::CorruptRecord { .. } => "corrupt_record",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::PeerUnavailable { .. } => "peer_unavailable",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::StoreLocked { .. } => "store_locked",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_peer_unavailable() {
        let err = TapeError::unavailable("tcp://10.0.0.2:8765", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("10.0.0.2"));
    }

    #[test]
    fn test_is_retryable_conflict() {
        let err = TapeError::ConcurrencyConflict {
            expected: 3,
            actual: 5,
        };
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("expected version 3"));
        assert!(msg.contains("found 5"));
    }

    #[test]
    fn test_is_retryable_io() {
        let err: TapeError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_not_retryable_corrupt() {
        let err = TapeError::corrupt(128, "hash mismatch");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("offset 128"));
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_not_retryable_invalid_argument() {
        let err = TapeError::invalid("payload must contain at least one byte");
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_not_retryable_protocol() {
        let err = TapeError::Protocol("expected 8-byte version frame".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_store_locked() {
        let err = TapeError::StoreLocked {
            path: "/var/lib/tapes/lock-store.txt".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("lock-store.txt"));
    }

    #[test]
    fn test_not_retryable_shutdown_and_internal() {
        assert!(!TapeError::Shutdown.is_retryable());
        assert!(!TapeError::Internal("unexpected".into()).is_retryable());
        assert!(!TapeError::Config("no peers".into()).is_retryable());
    }
}
