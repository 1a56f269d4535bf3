//! Read-through object cache.
//!
//! Records are cached whole under `"{prefix}:{id}"` and evicted (never
//! updated in place) when the store reports a mutation.

use crate::backend::{bounded, CacheBackend};
use crate::config::FeedConfig;
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use crate::invalidation::ObjectInvalidator;
use crate::key::CacheKeyBuilder;
use crate::model::{EntityKind, Post, User};
use crate::observability::{CacheMetrics, NoOpMetrics, TtlPolicy};
use crate::repository::DataRepository;
use crate::strategy::CacheStrategy;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Object cache - looks records up by primary key, falling back to a
/// [`DataRepository`] on miss.
///
/// # Example
///
/// ```ignore
/// use feed_kit::{ObjectCache, FeedConfig, backend::InMemoryBackend};
///
/// let cache = ObjectCache::new(InMemoryBackend::new(), &FeedConfig::default());
/// let post: Post = cache.get(&post_id, &store).await?;
/// ```
pub struct ObjectCache<B: CacheBackend> {
    backend: B,
    timeout: Duration,
    metrics: Arc<dyn CacheMetrics>,
    ttl_policy: TtlPolicy,
}

impl<B: CacheBackend> ObjectCache<B> {
    pub fn new(backend: B, config: &FeedConfig) -> Self {
        ObjectCache {
            backend,
            timeout: config.cache_timeout,
            metrics: Arc::new(NoOpMetrics),
            ttl_policy: config.ttl_policy.clone(),
        }
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set custom TTL policy.
    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    /// Read-through lookup.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound`: the store has no row with this id
    /// - `Error::RepositoryError`: the store lookup failed
    /// - `Error::ValidationError`: the loaded record failed `validate()`
    ///
    /// Cache-store failures are never returned; they degrade to a store read.
    pub async fn get<T, R>(&self, id: &T::Key, repository: &R) -> Result<T>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        self.get_with(id, repository, CacheStrategy::Refresh).await
    }

    /// Lookup with an explicit [`CacheStrategy`].
    pub async fn get_with<T, R>(
        &self,
        id: &T::Key,
        repository: &R,
        strategy: CacheStrategy,
    ) -> Result<T>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        let timer = Instant::now();
        let cache_key = CacheKeyBuilder::build::<T>(id);

        debug!(
            "» Cache operation for key: {} (strategy: {})",
            cache_key, strategy
        );

        let cache_up = match strategy {
            CacheStrategy::Refresh => match self.read_cached::<T>(&cache_key).await {
                Ok(Some(entity)) => {
                    self.metrics.record_hit(&cache_key, timer.elapsed());
                    return Ok(entity);
                }
                Ok(None) => true,
                Err(_) => false,
            },
            CacheStrategy::Invalidate => self.evict(&cache_key).await,
            CacheStrategy::Bypass => {
                debug!("Bypassing cache for {}", cache_key);
                true
            }
        };

        let entity = repository
            .fetch_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(T::cache_prefix(), id))?;
        entity.validate()?;
        self.metrics.record_miss(&cache_key, timer.elapsed());

        if cache_up {
            self.populate(&cache_key, &entity).await;
        }
        Ok(entity)
    }

    /// Batch lookup. Ids the store does not know are omitted; order of the
    /// found records follows `ids`.
    pub async fn get_many<T, R>(&self, ids: &[T::Key], repository: &R) -> Result<Vec<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(CacheKeyBuilder::build::<T>).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();

        let (cached, cache_up) = match bounded(self.timeout, self.backend.mget(&key_refs)).await {
            Ok(cached) => (cached, true),
            Err(e) => {
                warn!("Object cache unavailable for batch of {}: {}", ids.len(), e);
                self.metrics.record_error(T::cache_prefix(), &e.to_string());
                (vec![None; ids.len()], false)
            }
        };

        let mut found = Vec::with_capacity(ids.len());
        let mut misses = 0usize;
        for ((id, key), bytes) in ids.iter().zip(&keys).zip(cached) {
            let hit = bytes.and_then(|bytes| match T::deserialize_from_cache(&bytes) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!("Dropping corrupt cache entry {}: {}", key, e);
                    None
                }
            });

            if let Some(entity) = hit {
                found.push(entity);
                continue;
            }

            misses += 1;
            if let Some(entity) = repository.fetch_by_id(id).await? {
                if cache_up {
                    self.populate(key, &entity).await;
                }
                found.push(entity);
            }
        }

        debug!(
            "✓ Batch lookup of {} {} ({} from store)",
            ids.len(),
            T::cache_prefix(),
            misses
        );
        Ok(found)
    }

    /// Evict one record. Idempotent.
    pub async fn invalidate<T: CacheEntity>(&self, id: &T::Key) -> Result<()> {
        self.invalidate_key(&CacheKeyBuilder::build::<T>(id)).await
    }

    pub async fn invalidate_key(&self, cache_key: &str) -> Result<()> {
        bounded(self.timeout, self.backend.delete(cache_key)).await?;
        debug!("✓ Cache invalidated for {}", cache_key);
        Ok(())
    }

    /// Get backend reference (for advanced use).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Cached value for `cache_key`. `Err` means the cache could not be
    /// consulted; corrupt entries are evicted and reported as a miss.
    async fn read_cached<T: CacheEntity>(&self, cache_key: &str) -> Result<Option<T>> {
        let bytes = match bounded(self.timeout, self.backend.get(cache_key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Object cache unavailable for {}, reading store: {}", cache_key, e);
                self.metrics.record_error(cache_key, &e.to_string());
                return Err(e);
            }
        };

        let entity = T::deserialize_from_cache(&bytes).and_then(|entity| {
            entity.validate()?;
            Ok(entity)
        });
        match entity {
            Ok(entity) => {
                debug!("✓ Cache hit for {}", cache_key);
                Ok(Some(entity))
            }
            Err(e) => {
                warn!("Evicting unusable cache entry {}: {}", cache_key, e);
                self.evict(cache_key).await;
                Ok(None)
            }
        }
    }

    async fn populate<T: CacheEntity>(&self, cache_key: &str, entity: &T) {
        let bytes = match entity.serialize_for_cache() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Not caching {}: {}", cache_key, e);
                return;
            }
        };
        let ttl = self.ttl_policy.get_ttl(T::cache_prefix());
        if let Err(e) = bounded(self.timeout, self.backend.set(cache_key, bytes, ttl)).await {
            warn!("Failed to populate {}: {}", cache_key, e);
            self.metrics.record_error(cache_key, &e.to_string());
        }
    }

    /// Best-effort delete; `false` when the cache is unreachable.
    async fn evict(&self, cache_key: &str) -> bool {
        match bounded(self.timeout, self.backend.delete(cache_key)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to evict {}: {}", cache_key, e);
                self.metrics.record_error(cache_key, &e.to_string());
                false
            }
        }
    }
}

impl<B: CacheBackend> ObjectInvalidator for ObjectCache<B> {
    fn invalidate_object(&self, kind: EntityKind, id: u64) -> BoxFuture<'_, Result<()>> {
        let cache_key = match kind {
            EntityKind::Post => CacheKeyBuilder::build::<Post>(&id),
            EntityKind::User => CacheKeyBuilder::build::<User>(&id),
            EntityKind::Follow | EntityKind::FeedEntry => {
                return futures::future::ready(Ok(())).boxed()
            }
        };
        async move { self.invalidate_key(&cache_key).await }.boxed()
    }
}
