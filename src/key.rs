//! Cache key construction.

use crate::entity::CacheEntity;
use crate::model::UserId;
use std::fmt;

/// Builds object cache keys: `"{prefix}:{id}"`.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    pub fn build<T: CacheEntity>(id: &T::Key) -> String {
        Self::build_with_prefix(T::cache_prefix(), id)
    }

    pub fn build_with_prefix(prefix: &str, id: &dyn fmt::Display) -> String {
        format!("{}:{}", prefix, id)
    }
}

/// Logical key of a cached list: entity type, owner and list name.
///
/// Renders as `"{entity}:{owner}:{list}"`, e.g. `"newsfeed:42:timeline"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListKey {
    entity: &'static str,
    owner: UserId,
    list: &'static str,
}

impl ListKey {
    pub fn new(entity: &'static str, owner: UserId, list: &'static str) -> Self {
        ListKey {
            entity,
            owner,
            list,
        }
    }

    /// Feed entries shown on `user`'s timeline.
    pub fn timeline(user: UserId) -> Self {
        Self::new("newsfeed", user, "timeline")
    }

    /// Posts authored by `user`.
    pub fn user_posts(user: UserId) -> Self {
        Self::new("post", user, "authored")
    }

    /// Prefix used for TTL selection.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }
}

impl fmt::Display for ListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.entity, self.owner, self.list)
    }
}
