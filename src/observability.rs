//! Metrics hooks and TTL policy.

use std::time::Duration;

/// Observer for cache and fan-out activity.
///
/// All methods default to no-ops so implementors only record what they need.
pub trait CacheMetrics: Send + Sync {
    fn record_hit(&self, _key: &str, _duration: Duration) {}

    fn record_miss(&self, _key: &str, _duration: Duration) {}

    /// A cache-store failure that was absorbed by falling back to the store.
    fn record_error(&self, _key: &str, _error: &str) {}

    /// One completed fan-out pass.
    fn record_fanout(&self, _recipients: usize, _failed: usize, _duration: Duration) {}
}

/// Metrics sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {}

/// Expiry applied when writing cache entries.
///
/// Explicit invalidation is the consistency mechanism; a TTL only bounds how
/// long a missed invalidation can linger.
#[derive(Clone, Default)]
pub enum TtlPolicy {
    /// Entries persist until invalidated.
    #[default]
    Infinite,
    /// Same TTL for every entry.
    Fixed(Duration),
    /// TTL chosen by cache prefix (e.g. "post", "newsfeed").
    PerType(fn(&str) -> Duration),
}

impl std::fmt::Debug for TtlPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TtlPolicy::Infinite => write!(f, "Infinite"),
            TtlPolicy::Fixed(ttl) => write!(f, "Fixed({:?})", ttl),
            TtlPolicy::PerType(_) => write!(f, "PerType(..)"),
        }
    }
}

impl TtlPolicy {
    pub fn get_ttl(&self, prefix: &str) -> Option<Duration> {
        match self {
            TtlPolicy::Infinite => None,
            TtlPolicy::Fixed(ttl) => Some(*ttl),
            TtlPolicy::PerType(f) => Some(f(prefix)),
        }
    }
}
