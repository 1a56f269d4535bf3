//! Cache store backends.
//!
//! A backend is a key-value store with a handful of ordered-list
//! primitives. Every list mutation is atomic on the store side, so
//! concurrent pushes to one key never lose an item.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "inmemory")]
mod inmemory;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "inmemory")]
pub use self::inmemory::InMemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::{RedisBackend, RedisConfig};

/// Outcome of [`CacheBackend::list_push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListPush {
    /// Key is not cached; nothing was written.
    Cold,
    /// The item was already in the list.
    Present,
    /// The item was inserted and the list trimmed to its bound.
    Inserted,
}

/// Cache store contract.
///
/// Lists hold opaque items ordered by a descending `i64` score. A list key
/// is either cold (absent) or warm; a warm list may be empty.
pub trait CacheBackend: Send + Sync + Clone + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a key (value or list). Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Batch get; result order matches `keys`.
    fn mget(&self, keys: &[&str]) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await?);
            }
            Ok(results)
        }
    }

    fn mdelete(&self, keys: &[&str]) -> impl Future<Output = Result<()>> + Send {
        async move {
            for key in keys {
                self.delete(key).await?;
            }
            Ok(())
        }
    }

    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send;

    fn clear_all(&self) -> impl Future<Output = Result<()>> + Send;

    /// Items of a warm list in descending score order; `None` when cold.
    fn list_get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<Vec<u8>>>>> + Send;

    /// Warm a cold list with `items` (already `(score, item)`, any order).
    ///
    /// Returns `false` without writing if the key is already warm.
    fn list_init(
        &self,
        key: &str,
        items: Vec<(i64, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically insert `item` at its score position in a warm list and
    /// trim the list to `bound`, dropping the lowest scores.
    fn list_push(
        &self,
        key: &str,
        score: i64,
        item: Vec<u8>,
        bound: usize,
    ) -> impl Future<Output = Result<ListPush>> + Send;
}

/// Run one cache-store call under a deadline.
///
/// Elapsed deadlines surface as `Error::Timeout` so callers can fail open.
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

/// Backend that rejects every call, for exercising fail-open paths.
#[cfg(test)]
pub(crate) mod testing {
    use super::{CacheBackend, ListPush};
    use crate::error::{Error, Result};
    use std::time::Duration;

    #[derive(Clone, Copy, Debug, Default)]
    pub(crate) struct DownBackend;

    fn down() -> Error {
        Error::BackendError("connection refused".into())
    }

    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(down())
        }

        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            Err(down())
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(down())
        }

        async fn exists(&self, _key: &str) -> Result<bool> {
            Err(down())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(false)
        }

        async fn clear_all(&self) -> Result<()> {
            Err(down())
        }

        async fn list_get(&self, _key: &str) -> Result<Option<Vec<Vec<u8>>>> {
            Err(down())
        }

        async fn list_init(
            &self,
            _key: &str,
            _items: Vec<(i64, Vec<u8>)>,
            _ttl: Option<Duration>,
        ) -> Result<bool> {
            Err(down())
        }

        async fn list_push(
            &self,
            _key: &str,
            _score: i64,
            _item: Vec<u8>,
            _bound: usize,
        ) -> Result<ListPush> {
            Err(down())
        }
    }
}
