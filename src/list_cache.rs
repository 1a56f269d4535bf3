//! Bounded, reverse-chronological list cache.
//!
//! A cached list mirrors the newest `bound` rows of a store query. Reads load
//! a cold list once from the store; writers push single items into warm
//! lists and never warm a cold one. Every cache-store call is bounded by a
//! deadline, and an unavailable cache degrades to reading the store.

use crate::backend::{bounded, CacheBackend, ListPush};
use crate::config::FeedConfig;
use crate::error::Result;
use crate::key::ListKey;
use crate::model::Cursor;
use crate::observability::{CacheMetrics, NoOpMetrics, TtlPolicy};
use crate::serialization::{deserialize_from_cache, serialize_for_cache};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An item that can live in a cached list.
pub trait Listed: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Position of the item; lists are kept newest first by this cursor.
    fn cursor(&self) -> Cursor;
}

fn newest_first<T: Listed>(items: &mut [T]) {
    items.sort_by(|a, b| b.cursor().cmp(&a.cursor()));
}

/// List cache over a [`CacheBackend`].
pub struct ListCache<B: CacheBackend> {
    backend: B,
    bound: usize,
    timeout: Duration,
    ttl_policy: TtlPolicy,
    metrics: Arc<dyn CacheMetrics>,
}

impl<B: CacheBackend> ListCache<B> {
    pub fn new(backend: B, config: &FeedConfig) -> Self {
        ListCache {
            backend,
            bound: config.list_bound,
            timeout: config.cache_timeout,
            ttl_policy: config.ttl_policy.clone(),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Max items kept per list.
    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Read a whole list, loading it from the store when cold.
    ///
    /// `fallback` receives the bound and must return the newest rows of the
    /// underlying query. A warm-empty list is returned as an empty vector
    /// without calling it. If the cache is unavailable the fallback result is
    /// returned and nothing is written.
    ///
    /// After warming a cold list the store is read once more: rows committed
    /// while the first read was in flight were pushed to a cold key and
    /// dropped, so they are pushed again now that the list is warm.
    pub async fn load<T, F, Fut>(&self, key: &ListKey, fallback: F) -> Result<Vec<T>>
    where
        T: Listed,
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let timer = Instant::now();
        let cache_key = key.to_string();

        let cache_up = match bounded(self.timeout, self.backend.list_get(&cache_key)).await {
            Ok(Some(raw)) => match decode::<T>(&raw) {
                Ok(mut items) => {
                    newest_first(&mut items);
                    self.metrics.record_hit(&cache_key, timer.elapsed());
                    debug!("✓ List cache hit for {} ({} items)", cache_key, items.len());
                    return Ok(items);
                }
                Err(e) => {
                    warn!("Evicting corrupt list {}: {}", cache_key, e);
                    self.metrics.record_error(&cache_key, &e.to_string());
                    self.evict(&cache_key).await;
                    true
                }
            },
            Ok(None) => true,
            Err(e) => {
                warn!("List cache unavailable for {}, reading store: {}", cache_key, e);
                self.metrics.record_error(&cache_key, &e.to_string());
                false
            }
        };

        debug!("» List cache miss for {}, loading from store", cache_key);
        let items = self.read_store(&fallback).await?;
        self.metrics.record_miss(&cache_key, timer.elapsed());

        if !cache_up || !self.warm(key, &cache_key, &items).await {
            return Ok(items);
        }
        self.catch_up(key, &cache_key, &fallback, items).await
    }

    /// Insert one item into a warm list.
    ///
    /// Cold lists are left alone; the next read loads them with the item
    /// included. If the push itself fails the list is evicted so the next
    /// read reloads it from the store.
    pub async fn push<T: Listed>(&self, key: &ListKey, item: &T) -> Result<ListPush> {
        let cache_key = key.to_string();
        let bytes = serialize_for_cache(item)?;
        let score = item.cursor().score();

        match bounded(
            self.timeout,
            self.backend.list_push(&cache_key, score, bytes, self.bound),
        )
        .await
        {
            Ok(outcome) => {
                trace!("List push to {}: {:?}", cache_key, outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_error(&cache_key, &e.to_string());
                self.evict(&cache_key).await;
                Err(e)
            }
        }
    }

    /// Drop a list so the next read reloads it.
    pub async fn invalidate(&self, key: &ListKey) -> Result<()> {
        let cache_key = key.to_string();
        bounded(self.timeout, self.backend.delete(&cache_key)).await?;
        debug!("✓ List invalidated: {}", cache_key);
        Ok(())
    }

    /// Cached contents without touching the store; `None` when cold.
    pub async fn peek<T: Listed>(&self, key: &ListKey) -> Result<Option<Vec<T>>> {
        let cache_key = key.to_string();
        match bounded(self.timeout, self.backend.list_get(&cache_key)).await? {
            Some(raw) => {
                let mut items = decode::<T>(&raw)?;
                newest_first(&mut items);
                Ok(Some(items))
            }
            None => Ok(None),
        }
    }

    async fn read_store<T, F, Fut>(&self, fallback: &F) -> Result<Vec<T>>
    where
        T: Listed,
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let mut items = fallback(self.bound).await?;
        newest_first(&mut items);
        items.truncate(self.bound);
        Ok(items)
    }

    /// Returns `true` only if this call turned the cold key warm.
    async fn warm<T: Listed>(&self, key: &ListKey, cache_key: &str, items: &[T]) -> bool {
        let mut encoded = Vec::with_capacity(items.len());
        for item in items {
            match serialize_for_cache(item) {
                Ok(bytes) => encoded.push((item.cursor().score(), bytes)),
                Err(e) => {
                    warn!("Not caching list {}: {}", cache_key, e);
                    return false;
                }
            }
        }

        let ttl = self.ttl_policy.get_ttl(key.entity());
        match bounded(self.timeout, self.backend.list_init(cache_key, encoded, ttl)).await {
            Ok(true) => {
                debug!("✓ Warmed {} with {} items", cache_key, items.len());
                true
            }
            // Another reader warmed it first and runs its own catch-up.
            Ok(false) => {
                trace!("List {} already warm", cache_key);
                false
            }
            Err(e) => {
                warn!("Failed to warm list {}: {}", cache_key, e);
                self.metrics.record_error(cache_key, &e.to_string());
                false
            }
        }
    }

    /// Push rows the warming snapshot missed. If the store cannot be re-read
    /// the list is evicted rather than left possibly short.
    async fn catch_up<T, F, Fut>(
        &self,
        key: &ListKey,
        cache_key: &str,
        fallback: &F,
        snapshot: Vec<T>,
    ) -> Result<Vec<T>>
    where
        T: Listed,
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let fresh = match self.read_store(fallback).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Evicting {}, cannot re-read store: {}", cache_key, e);
                self.evict(cache_key).await;
                return Ok(snapshot);
            }
        };

        let known: HashSet<Cursor> = snapshot.iter().map(Listed::cursor).collect();
        let missed: Vec<&T> = fresh
            .iter()
            .filter(|item| !known.contains(&item.cursor()))
            .collect();
        if !missed.is_empty() {
            debug!("» Catching up {} with {} row(s)", cache_key, missed.len());
        }
        for item in missed {
            // A failed push evicts the list, so stop there.
            if let Err(e) = self.push(key, item).await {
                warn!("Catch-up push to {} failed: {}", cache_key, e);
                break;
            }
        }
        Ok(fresh)
    }

    async fn evict(&self, cache_key: &str) {
        if let Err(e) = bounded(self.timeout, self.backend.delete(cache_key)).await {
            warn!("Failed to evict list {}: {}", cache_key, e);
        }
    }
}

fn decode<T: Listed>(raw: &[Vec<u8>]) -> Result<Vec<T>> {
    raw.iter()
        .map(|bytes| deserialize_from_cache::<T>(bytes))
        .collect()
}
