//! Error types for ProcessHub core
//!
//! Explicit error variants with context, using thiserror.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("invalid hub id: {id}, reason: {reason}")]
    InvalidHubId { id: String, reason: String },

    #[error("invalid child id: {id}, reason: {reason}")]
    InvalidChildId { id: String, reason: String },

    #[error("child id too long: {length} bytes exceeds limit of {limit} bytes")]
    ChildIdTooLong { length: usize, limit: usize },

    #[error("worker state too large: {size} bytes exceeds limit of {limit} bytes")]
    WorkerStateTooLarge { size: usize, limit: usize },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    #[error("worker mailbox full: {child_id}, depth: {depth}, max: {max}")]
    WorkerMailboxFull {
        child_id: String,
        depth: usize,
        max: usize,
    },

    #[error("worker gone: {child_id}")]
    WorkerGone { child_id: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("deserialization failed: {reason}")]
    DeserializationFailed { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Create an invalid child id error
    pub fn invalid_child_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidChildId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker gone error
    pub fn worker_gone(child_id: impl Into<String>) -> Self {
        Self::WorkerGone {
            child_id: child_id.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_child_id("bad/id", "contains invalid characters");
        assert!(err.to_string().contains("bad/id"));
    }

    #[test]
    fn test_worker_gone() {
        let err = Error::worker_gone("w1");
        assert!(matches!(err, Error::WorkerGone { .. }));
    }
}
