//! Read strategies for the object cache.

use std::fmt;

/// How an object read treats the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Cache first, store on miss, populate cache. The default read-through.
    #[default]
    Refresh,
    /// Evict the key, then behave like `Refresh`.
    Invalidate,
    /// Read the store directly; the result still populates the cache.
    Bypass,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStrategy::Refresh => write!(f, "Refresh"),
            CacheStrategy::Invalidate => write!(f, "Invalidate"),
            CacheStrategy::Bypass => write!(f, "Bypass"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_read_through() {
        assert_eq!(CacheStrategy::default(), CacheStrategy::Refresh);
        assert_eq!(CacheStrategy::Bypass.to_string(), "Bypass");
    }
}
