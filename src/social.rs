//! Following-set cache.
//!
//! Answers "does the viewer follow X?" for every row of a listing with one
//! lookup per request instead of one query per row.

use crate::backend::CacheBackend;
use crate::config::FeedConfig;
use crate::entity::CacheEntity;
use crate::error::Result;
use crate::invalidation::FollowingInvalidator;
use crate::model::UserId;
use crate::object_cache::ObjectCache;
use crate::repository::{DataRepository, SocialGraph};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::OnceCell;

/// Everyone a user follows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowingSet {
    pub user_id: UserId,
    pub followees: BTreeSet<UserId>,
}

impl FollowingSet {
    /// Set seen by an anonymous viewer.
    pub fn anonymous() -> Self {
        FollowingSet::default()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.followees.contains(&user_id)
    }

    pub fn len(&self) -> usize {
        self.followees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.followees.is_empty()
    }
}

impl CacheEntity for FollowingSet {
    type Key = UserId;

    fn cache_key(&self) -> Self::Key {
        self.user_id
    }

    fn cache_prefix() -> &'static str {
        "followings"
    }
}

/// Loads a [`FollowingSet`] from the social graph.
struct GraphRepository<'a, G>(&'a G);

impl<G: SocialGraph> DataRepository<FollowingSet> for GraphRepository<'_, G> {
    async fn fetch_by_id(&self, user_id: &UserId) -> Result<Option<FollowingSet>> {
        let followees = self.0.followee_ids(*user_id).await?;
        Ok(Some(FollowingSet {
            user_id: *user_id,
            followees: followees.into_iter().collect(),
        }))
    }
}

/// Read-through cache of following sets, one entry per user.
///
/// The social graph is passed per call, like the repository of an
/// [`ObjectCache`] lookup.
pub struct FollowingSetCache<B: CacheBackend> {
    sets: ObjectCache<B>,
}

impl<B: CacheBackend> FollowingSetCache<B> {
    pub fn new(backend: B, config: &FeedConfig) -> Self {
        FollowingSetCache {
            sets: ObjectCache::new(backend, config),
        }
    }

    /// Following set of `viewer`; empty for anonymous viewers.
    pub async fn following_set<G: SocialGraph>(
        &self,
        viewer: Option<UserId>,
        graph: &G,
    ) -> Result<FollowingSet> {
        let Some(user_id) = viewer else {
            return Ok(FollowingSet::anonymous());
        };
        self.sets.get(&user_id, &GraphRepository(graph)).await
    }

    pub async fn invalidate(&self, user_id: UserId) -> Result<()> {
        self.sets.invalidate::<FollowingSet>(&user_id).await
    }

    /// Request-scoped view for one viewer.
    pub fn memo<'a, G: SocialGraph>(
        &'a self,
        viewer: Option<UserId>,
        graph: &'a G,
    ) -> FollowingMemo<'a, B, G> {
        FollowingMemo {
            cache: self,
            graph,
            viewer,
            set: OnceCell::new(),
        }
    }
}

impl<B: CacheBackend> FollowingInvalidator for FollowingSetCache<B> {
    fn invalidate_following(&self, user_id: UserId) -> BoxFuture<'_, Result<()>> {
        async move { self.invalidate(user_id).await }.boxed()
    }
}

/// Following set of one viewer, resolved at most once.
///
/// Build one per rendering pass and drop it with the request; it never
/// observes invalidations that happen after the first lookup.
pub struct FollowingMemo<'a, B: CacheBackend, G: SocialGraph> {
    cache: &'a FollowingSetCache<B>,
    graph: &'a G,
    viewer: Option<UserId>,
    set: OnceCell<FollowingSet>,
}

impl<B: CacheBackend, G: SocialGraph> FollowingMemo<'_, B, G> {
    pub fn viewer(&self) -> Option<UserId> {
        self.viewer
    }

    pub async fn following_set(&self) -> Result<&FollowingSet> {
        self.set
            .get_or_try_init(|| self.cache.following_set(self.viewer, self.graph))
            .await
    }

    /// Whether the viewer follows `user_id`. Always `false` when anonymous.
    pub async fn has_followed(&self, user_id: UserId) -> Result<bool> {
        if self.viewer.is_none() {
            return Ok(false);
        }
        Ok(self.following_set().await?.contains(user_id))
    }
}
