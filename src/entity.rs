//! Core entity trait that all object-cached records implement.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;

/// Trait for records stored in the object cache under `"{prefix}:{key}"`.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use feed_kit::CacheEntity;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct Badge {
///     pub id: u64,
///     pub label: String,
/// }
///
/// impl CacheEntity for Badge {
///     type Key = u64;
///
///     fn cache_key(&self) -> Self::Key {
///         self.id
///     }
///
///     fn cache_prefix() -> &'static str {
///         "badge"
///     }
/// }
/// ```
pub trait CacheEntity: Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone + 'static {
    /// Type of the record's primary key.
    type Key: Display + Clone + Send + Sync + Eq + Hash + 'static;

    /// Return the record's primary key.
    fn cache_key(&self) -> Self::Key;

    /// Namespace of this record type, e.g. "post", "user".
    ///
    /// Also used as the entity name in `NotFound` errors and as the TTL
    /// policy selector.
    fn cache_prefix() -> &'static str;

    /// Serialize for cache storage.
    ///
    /// Not meant to be overridden: every cached value shares the envelope in
    /// `crate::serialization`.
    fn serialize_for_cache(&self) -> Result<Vec<u8>> {
        crate::serialization::serialize_for_cache(self)
    }

    /// Deserialize from cache storage, validating the envelope.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCacheEntry`: bad magic or truncated envelope
    /// - `Error::VersionMismatch`: schema version changed
    /// - `Error::DeserializationError`: corrupted payload
    fn deserialize_from_cache(bytes: &[u8]) -> Result<Self> {
        crate::serialization::deserialize_from_cache(bytes)
    }

    /// Optional check run after loading from cache.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
