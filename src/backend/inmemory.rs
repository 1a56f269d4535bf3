//! In-memory cache backend.

use super::{CacheBackend, ListPush};
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Stored {
    Bytes(Vec<u8>),
    /// Kept sorted by descending score.
    List(Vec<(i64, Vec<u8>)>),
}

struct Slot {
    value: Stored,
    expires_at: Option<Instant>,
    /// Logical access clock for LRU eviction.
    touched: u64,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner {
    map: DashMap<String, Slot>,
    capacity: Option<usize>,
    clock: AtomicU64,
}

/// Thread-safe in-memory backend built on `DashMap`.
///
/// Cloning is cheap and clones share the same storage. With a capacity set,
/// inserting a key into a full cache evicts the least recently used keys.
/// The capacity is enforced after each insert, so concurrent inserts may
/// overshoot it briefly; each eviction scans the map for its victim, which
/// suits tests and small working sets rather than large caches.
///
/// # Example
///
/// ```
/// # use feed_kit::backend::{CacheBackend, InMemoryBackend};
/// # async fn example() -> feed_kit::Result<()> {
/// let backend = InMemoryBackend::new();
/// backend.set("post:1", b"value".to_vec(), None).await?;
/// assert!(backend.exists("post:1").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Unbounded backend.
    pub fn new() -> Self {
        InMemoryBackend {
            inner: Arc::new(Inner {
                map: DashMap::new(),
                capacity: None,
                clock: AtomicU64::new(0),
            }),
        }
    }

    /// Backend holding at most `capacity` keys, evicting least recently used.
    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryBackend {
            inner: Arc::new(Inner {
                map: DashMap::with_capacity(capacity),
                capacity: Some(capacity.max(1)),
                clock: AtomicU64::new(0),
            }),
        }
    }

    /// Number of stored keys (expired keys included until touched).
    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|d| Instant::now() + d)
    }

    /// Drop `key` if its TTL has elapsed.
    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.inner.map.remove_if(key, |_, slot| slot.is_expired(now));
    }

    /// Evict least recently used keys, other than the one just written,
    /// until the map is back within capacity. Must not be called while a
    /// map guard is held.
    fn enforce_capacity(&self, written: &str) {
        let Some(capacity) = self.inner.capacity else {
            return;
        };
        while self.inner.map.len() > capacity {
            let victim = self
                .inner
                .map
                .iter()
                .filter(|entry| entry.key() != written)
                .min_by_key(|entry| entry.value().touched)
                .map(|entry| entry.key().clone());

            match victim {
                Some(victim) => {
                    self.inner.map.remove(&victim);
                    debug!("✓ InMemory EVICT {} (capacity {})", victim, capacity);
                }
                None => break,
            }
        }
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.purge_expired(key);
        let tick = self.tick();
        match self.inner.map.get_mut(key) {
            Some(mut slot) => {
                slot.touched = tick;
                match &slot.value {
                    Stored::Bytes(bytes) => Ok(Some(bytes.clone())),
                    Stored::List(_) => Err(Error::BackendError(format!(
                        "WRONGTYPE: {} holds a list",
                        key
                    ))),
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let slot = Slot {
            value: Stored::Bytes(value),
            expires_at: Self::expiry(ttl),
            touched: self.tick(),
        };
        self.inner.map.insert(key.to_string(), slot);
        self.enforce_capacity(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.map.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.purge_expired(key);
        Ok(self.inner.map.contains_key(key))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn clear_all(&self) -> Result<()> {
        self.inner.map.clear();
        warn!("⚠ InMemory cache cleared");
        Ok(())
    }

    async fn list_get(&self, key: &str) -> Result<Option<Vec<Vec<u8>>>> {
        self.purge_expired(key);
        let tick = self.tick();
        match self.inner.map.get_mut(key) {
            Some(mut slot) => {
                slot.touched = tick;
                match &slot.value {
                    Stored::List(items) => Ok(Some(
                        items.iter().map(|(_, item)| item.clone()).collect(),
                    )),
                    Stored::Bytes(_) => Err(Error::BackendError(format!(
                        "WRONGTYPE: {} holds a value",
                        key
                    ))),
                }
            }
            None => Ok(None),
        }
    }

    async fn list_init(
        &self,
        key: &str,
        mut items: Vec<(i64, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.purge_expired(key);
        items.sort_by(|a, b| b.0.cmp(&a.0));
        let touched = self.tick();

        let written = match self.inner.map.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Stored::List(items),
                    expires_at: Self::expiry(ttl),
                    touched,
                });
                true
            }
        };
        if written {
            self.enforce_capacity(key);
        }
        Ok(written)
    }

    async fn list_push(
        &self,
        key: &str,
        score: i64,
        item: Vec<u8>,
        bound: usize,
    ) -> Result<ListPush> {
        self.purge_expired(key);
        let tick = self.tick();

        // The shard write lock held by `get_mut` makes check-insert-trim atomic.
        let Some(mut slot) = self.inner.map.get_mut(key) else {
            return Ok(ListPush::Cold);
        };
        slot.touched = tick;

        let Stored::List(items) = &mut slot.value else {
            return Err(Error::BackendError(format!(
                "WRONGTYPE: {} holds a value",
                key
            )));
        };

        if items.iter().any(|(_, existing)| *existing == item) {
            return Ok(ListPush::Present);
        }

        let position = items
            .iter()
            .position(|(existing, _)| *existing < score)
            .unwrap_or(items.len());
        items.insert(position, (score, item));
        items.truncate(bound);
        Ok(ListPush::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = InMemoryBackend::new();
        backend.set("k", b"v".to_vec(), None).await.unwrap();

        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(backend.exists("k").await.unwrap());

        backend.delete("k").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), None);
        // idempotent
        backend.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = InMemoryBackend::new();
        backend
            .set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_mget_preserves_order() {
        let backend = InMemoryBackend::new();
        backend.set("a", b"1".to_vec(), None).await.unwrap();
        backend.set("c", b"3".to_vec(), None).await.unwrap();

        let values = backend.mget(&["a", "b", "c"]).await.unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }

    #[tokio::test]
    async fn test_cold_and_empty_lists_differ() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.list_get("l").await.unwrap(), None);

        assert!(backend.list_init("l", Vec::new(), None).await.unwrap());
        assert_eq!(backend.list_get("l").await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_list_init_is_set_if_absent() {
        let backend = InMemoryBackend::new();
        assert!(backend
            .list_init("l", vec![(1, b"a".to_vec())], None)
            .await
            .unwrap());
        assert!(!backend
            .list_init("l", vec![(2, b"b".to_vec())], None)
            .await
            .unwrap());

        assert_eq!(
            backend.list_get("l").await.unwrap(),
            Some(vec![b"a".to_vec()])
        );
    }

    #[tokio::test]
    async fn test_list_push_orders_dedupes_and_trims() {
        let backend = InMemoryBackend::new();

        assert_eq!(
            backend.list_push("l", 5, b"x".to_vec(), 3).await.unwrap(),
            ListPush::Cold
        );
        assert!(!backend.exists("l").await.unwrap());

        backend
            .list_init("l", vec![(10, b"a".to_vec()), (30, b"c".to_vec())], None)
            .await
            .unwrap();

        assert_eq!(
            backend.list_push("l", 20, b"b".to_vec(), 3).await.unwrap(),
            ListPush::Inserted
        );
        assert_eq!(
            backend.list_push("l", 20, b"b".to_vec(), 3).await.unwrap(),
            ListPush::Present
        );
        assert_eq!(
            backend.list_push("l", 40, b"d".to_vec(), 3).await.unwrap(),
            ListPush::Inserted
        );

        assert_eq!(
            backend.list_get("l").await.unwrap(),
            Some(vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()])
        );
    }

    #[tokio::test]
    async fn test_wrong_type_is_backend_error() {
        let backend = InMemoryBackend::new();
        backend.set("k", b"v".to_vec(), None).await.unwrap();
        let err = backend.list_get("k").await.unwrap_err();
        assert!(err.is_cache_unavailable());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let backend = InMemoryBackend::with_capacity(2);
        backend.set("a", b"1".to_vec(), None).await.unwrap();
        backend.set("b", b"2".to_vec(), None).await.unwrap();

        // touch "a" so "b" becomes least recently used
        backend.get("a").await.unwrap();
        backend.set("c", b"3".to_vec(), None).await.unwrap();

        assert_eq!(backend.len(), 2);
        assert!(backend.exists("a").await.unwrap());
        assert!(!backend.exists("b").await.unwrap());
        assert!(backend.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_pushes_keep_every_item() {
        let backend = InMemoryBackend::new();
        backend.list_init("l", Vec::new(), None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..32i64 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .list_push("l", i, i.to_le_bytes().to_vec(), 100)
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), ListPush::Inserted);
        }

        let items = backend.list_get("l").await.unwrap().unwrap();
        assert_eq!(items.len(), 32);
        assert_eq!(items[0], 31i64.to_le_bytes().to_vec());
        assert_eq!(items[31], 0i64.to_le_bytes().to_vec());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_holds_once_concurrent_inserts_finish() {
        let backend = InMemoryBackend::with_capacity(8);

        let mut handles = Vec::new();
        for i in 0..64u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.set(&format!("k{}", i), vec![i], None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(backend.len() <= 8, "{} keys over capacity", backend.len());
        assert!(!backend.is_empty());
    }
}
