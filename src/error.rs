//! Error types for feed-kit operations.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by caches, stores and the feed service.
///
/// Cache-store failures (`BackendError`, `Timeout`) are recovered locally by
/// falling back to the relational store; read paths never surface them.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested record does not exist in the store.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Structurally invalid relationship, e.g. following oneself.
    #[error("Invalid relationship: {0}")]
    InvalidRelationship(String),

    /// Input rejected before any write.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Cache store unreachable or command failed.
    #[error("Cache backend error: {0}")]
    BackendError(String),

    /// Cache store call exceeded its deadline.
    #[error("Cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Envelope header did not match.
    #[error("Invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    /// Entry was written by a different schema version.
    #[error("Cache schema version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Relational store failure.
    #[error("Repository error: {0}")]
    RepositoryError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for transient cache-store failures that must fail open.
    pub fn is_cache_unavailable(&self) -> bool {
        matches!(self, Error::BackendError(_) | Error::Timeout(_))
    }

    /// True when a cached payload could not be decoded and should be evicted.
    pub fn is_corrupt_entry(&self) -> bool {
        matches!(
            self,
            Error::DeserializationError(_)
                | Error::InvalidCacheEntry(_)
                | Error::VersionMismatch { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("post", 42);
        assert_eq!(err.to_string(), "post 42 not found");

        let err = Error::VersionMismatch {
            expected: 1,
            found: 7,
        };
        assert_eq!(
            err.to_string(),
            "Cache schema version mismatch: expected 1, found 7"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::BackendError("down".into()).is_cache_unavailable());
        assert!(Error::Timeout(Duration::from_millis(5)).is_cache_unavailable());
        assert!(!Error::RepositoryError("db".into()).is_cache_unavailable());

        assert!(Error::InvalidCacheEntry("magic".into()).is_corrupt_entry());
        assert!(!Error::not_found("user", 1).is_corrupt_entry());
        assert!(Error::not_found("user", 1).is_not_found());
    }
}
