//! Feed service: the operations exposed to request handlers.
//!
//! Wires the store, the three caches, the invalidation registry and the
//! fan-out engine together. Constructed once per process and shared.

use crate::backend::CacheBackend;
use crate::config::{FanoutMode, FeedConfig};
use crate::error::{Error, Result};
use crate::fanout::{FanoutEngine, FanoutReport, FanoutTask};
use crate::invalidation::{register_cache_listeners, InvalidationRegistry, RegistryBuilder};
use crate::key::ListKey;
use crate::list_cache::ListCache;
use crate::model::{
    FeedEntry, Follow, FollowRow, Post, PostId, PostRef, PostStatus, PostView, TimelineItem, User,
    UserId,
};
use crate::object_cache::ObjectCache;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::pagination::{EndlessPaginator, EndlessRequest, OffsetPage, OffsetPaginator, Page};
use crate::repository::{FeedStore, Inserted, SocialGraph};
use crate::social::FollowingSetCache;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Builder for [`FeedService`].
pub struct FeedServiceBuilder<S, B> {
    store: Arc<S>,
    backend: B,
    config: FeedConfig,
    metrics: Arc<dyn CacheMetrics>,
    listeners: RegistryBuilder,
}

impl<S, B> FeedServiceBuilder<S, B>
where
    S: FeedStore + SocialGraph,
    B: CacheBackend,
{
    pub fn config(mut self, config: FeedConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Extra listeners, run before the default cache bindings.
    pub fn listeners(mut self, listeners: RegistryBuilder) -> Self {
        self.listeners = listeners;
        self
    }

    /// Build the service and install its invalidation hooks on the store.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` when the configuration is unusable.
    pub fn build(self) -> Result<FeedService<S, B>> {
        self.config.validate()?;
        let config = self.config;

        let objects = Arc::new(
            ObjectCache::new(self.backend.clone(), &config).with_metrics(Arc::clone(&self.metrics)),
        );
        let lists = Arc::new(
            ListCache::new(self.backend.clone(), &config).with_metrics(Arc::clone(&self.metrics)),
        );
        let followings = Arc::new(FollowingSetCache::new(self.backend, &config));
        let fanout = Arc::new(
            FanoutEngine::new(Arc::clone(&self.store), Arc::clone(&lists), &config)
                .with_metrics(self.metrics),
        );

        let registry = Arc::new(
            register_cache_listeners(self.listeners, objects.clone(), followings.clone()).build(),
        );
        self.store.install_hooks(Arc::clone(&registry));
        debug!("✓ Invalidation hooks installed: {:?}", registry);

        Ok(FeedService {
            endless: EndlessPaginator::from_config(&config),
            offset: OffsetPaginator::from_config(&config),
            config,
            store: self.store,
            objects,
            lists,
            followings,
            fanout,
            registry,
            pending: Mutex::new(Vec::new()),
        })
    }
}

/// Timeline, publishing and follow operations over a [`FeedStore`] and a
/// [`CacheBackend`].
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(InMemoryStore::new());
/// let service = FeedService::new(store, InMemoryBackend::new(), FeedConfig::from_env())?;
///
/// let post = service.publish(author.id, "hello, world").await?;
/// let page = service.timeline(reader.id, &EndlessRequest::first()).await?;
/// ```
pub struct FeedService<S, B>
where
    S: FeedStore + SocialGraph,
    B: CacheBackend,
{
    config: FeedConfig,
    store: Arc<S>,
    objects: Arc<ObjectCache<B>>,
    lists: Arc<ListCache<B>>,
    followings: Arc<FollowingSetCache<B>>,
    fanout: Arc<FanoutEngine<S, B>>,
    registry: Arc<InvalidationRegistry>,
    endless: EndlessPaginator,
    offset: OffsetPaginator,
    pending: Mutex<Vec<JoinHandle<Result<FanoutReport>>>>,
}

impl<S, B> FeedService<S, B>
where
    S: FeedStore + SocialGraph,
    B: CacheBackend,
{
    pub fn builder(store: Arc<S>, backend: B) -> FeedServiceBuilder<S, B> {
        FeedServiceBuilder {
            store,
            backend,
            config: FeedConfig::default(),
            metrics: Arc::new(NoOpMetrics),
            listeners: InvalidationRegistry::builder(),
        }
    }

    pub fn new(store: Arc<S>, backend: B, config: FeedConfig) -> Result<Self> {
        Self::builder(store, backend).config(config).build()
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn object_cache(&self) -> &ObjectCache<B> {
        &self.objects
    }

    pub fn list_cache(&self) -> &ListCache<B> {
        &self.lists
    }

    pub fn registry(&self) -> &InvalidationRegistry {
        &self.registry
    }

    /// Engine used by `publish`, e.g. to re-deliver a report's failures.
    pub fn fanout_engine(&self) -> &Arc<FanoutEngine<S, B>> {
        &self.fanout
    }

    pub async fn register_user(&self, username: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::ValidationError("username must not be empty".into()));
        }
        let user = self.store.create_user(username).await?;
        info!("✓ Registered user {} ({})", user.id, user.username);
        Ok(user)
    }

    pub async fn update_user(&self, user_id: UserId, display_name: &str) -> Result<User> {
        self.store
            .update_user(user_id, display_name)
            .await?
            .ok_or_else(|| Error::not_found("user", user_id))
    }

    pub async fn user(&self, user_id: UserId) -> Result<User> {
        self.objects.get(&user_id, self.store.as_ref()).await
    }

    pub async fn post(&self, post_id: PostId) -> Result<Post> {
        self.objects.get(&post_id, self.store.as_ref()).await
    }

    /// Publish a post and fan it out.
    ///
    /// Once the post row is committed the call succeeds whatever happens
    /// during fan-out, and delivery runs on a detached task that finishes
    /// even if this call is dropped. The call waits for the author's own
    /// timeline entry; followers are awaited only in [`FanoutMode::Inline`].
    /// Recipients that could not be written show up in
    /// [`FeedService::undelivered`].
    ///
    /// # Errors
    ///
    /// - `Error::ValidationError`: body length outside the configured range
    /// - `Error::NotFound`: unknown author
    pub async fn publish(&self, author_id: UserId, body: &str) -> Result<Post> {
        let chars = body.chars().count();
        if chars < self.config.min_body_chars || chars > self.config.max_body_chars {
            return Err(Error::ValidationError(format!(
                "post body must be {}..={} characters, got {}",
                self.config.min_body_chars, self.config.max_body_chars, chars
            )));
        }
        self.user(author_id).await?;

        let post = self.store.create_post(author_id, body).await?;
        info!("✓ Published post {} by user {}", post.id, author_id);

        // No await between the commit and the spawn.
        let FanoutTask {
            author_delivered,
            handle,
        } = self.fanout.spawn(post.clone());
        let inline = match self.config.fanout_mode {
            FanoutMode::Inline => Some(handle),
            FanoutMode::Background => {
                self.track(handle);
                None
            }
        };

        if !author_delivered.await.unwrap_or(false) {
            warn!("Post {} is not on its author's timeline yet", post.id);
        }

        if let Some(handle) = inline {
            match handle.await {
                Ok(Ok(report)) if !report.is_complete() => {
                    warn!(
                        "Post {} published with {} undelivered recipient(s)",
                        post.id,
                        report.failed.len()
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Fan-out task for post {} died: {}", post.id, e),
            }
        }
        Ok(post)
    }

    /// Hide or show a post.
    pub async fn moderate_post(&self, post_id: PostId, status: PostStatus) -> Result<Post> {
        let post = self
            .store
            .set_post_status(post_id, status)
            .await?
            .ok_or_else(|| Error::not_found("post", post_id))?;
        info!("✓ Post {} is now {:?}", post_id, status);
        Ok(post)
    }

    /// Delete a post. Feed entries pointing at it are skipped on render.
    pub async fn delete_post(&self, post_id: PostId) -> Result<Post> {
        let post = self
            .store
            .delete_post(post_id)
            .await?
            .ok_or_else(|| Error::not_found("post", post_id))?;
        info!("✓ Deleted post {}", post_id);
        Ok(post)
    }

    /// One page of `user_id`'s timeline, newest first.
    pub async fn timeline(
        &self,
        user_id: UserId,
        request: &EndlessRequest,
    ) -> Result<Page<TimelineItem>> {
        let store = self.store.as_ref();
        let cached: Vec<FeedEntry> = self
            .lists
            .load(&ListKey::timeline(user_id), move |limit| {
                store.feed_entries(user_id, None, limit)
            })
            .await?;

        let page = self
            .endless
            .paginate(cached, self.lists.bound(), request, move |before, limit| {
                store.feed_entries(user_id, before, limit)
            })
            .await?;

        let post_ids: Vec<PostId> = page.items.iter().map(|e| e.post_id).collect();
        let mut views = self.render_posts(&post_ids).await?;
        let items = page
            .items
            .iter()
            .filter_map(|entry| {
                views.remove(&entry.post_id).map(|post| TimelineItem {
                    entry_id: entry.id,
                    created_at: entry.created_at,
                    post,
                })
            })
            .collect();

        Ok(page.with_items(items))
    }

    /// One page of the posts `author_id` wrote, newest first.
    pub async fn user_posts(
        &self,
        author_id: UserId,
        request: &EndlessRequest,
    ) -> Result<Page<PostView>> {
        let store = self.store.as_ref();
        let cached: Vec<PostRef> = self
            .lists
            .load(&ListKey::user_posts(author_id), move |limit| {
                store.posts_by_author(author_id, None, limit)
            })
            .await?;

        let page = self
            .endless
            .paginate(cached, self.lists.bound(), request, move |before, limit| {
                store.posts_by_author(author_id, before, limit)
            })
            .await?;

        let post_ids: Vec<PostId> = page.items.iter().map(|r| r.id).collect();
        let mut views = self.render_posts(&post_ids).await?;
        let items = post_ids.iter().filter_map(|id| views.remove(id)).collect();

        Ok(page.with_items(items))
    }

    /// Follow `followee_id`. Following twice reports `Inserted::Duplicate`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidRelationship`: self-follow
    /// - `Error::NotFound`: either user does not exist
    pub async fn follow(&self, follower_id: UserId, followee_id: UserId) -> Result<Inserted<Follow>> {
        if follower_id == followee_id {
            return Err(Error::InvalidRelationship(format!(
                "user {} cannot follow themselves",
                follower_id
            )));
        }
        self.user(follower_id).await?;
        self.user(followee_id).await?;

        let inserted = self.store.insert_follow(follower_id, followee_id).await?;
        match &inserted {
            Inserted::Created(_) => info!("✓ User {} follows {}", follower_id, followee_id),
            Inserted::Duplicate(_) => {
                debug!("User {} already follows {}", follower_id, followee_id)
            }
        }
        Ok(inserted)
    }

    /// Stop following. Returns whether an edge was removed.
    pub async fn unfollow(&self, follower_id: UserId, followee_id: UserId) -> Result<bool> {
        if follower_id == followee_id {
            return Err(Error::InvalidRelationship(format!(
                "user {} cannot unfollow themselves",
                follower_id
            )));
        }
        let removed = self
            .store
            .delete_follow(follower_id, followee_id)
            .await?
            .is_some();
        if removed {
            info!("✓ User {} unfollowed {}", follower_id, followee_id);
        }
        Ok(removed)
    }

    /// Users following `user_id`, annotated for `viewer`.
    pub async fn followers(
        &self,
        viewer: Option<UserId>,
        user_id: UserId,
        page: Option<usize>,
        size: Option<usize>,
    ) -> Result<OffsetPage<FollowRow>> {
        let total = self.store.count_followers(user_id).await?;
        let window = self.offset.window(page, size, total)?;
        let edges = self
            .store
            .followers(user_id, window.offset, window.page_size)
            .await?;
        let rows = self
            .follow_rows(viewer, edges, |follow| follow.follower_id)
            .await?;
        Ok(window.into_page(rows))
    }

    /// Users `user_id` follows, annotated for `viewer`.
    pub async fn followings(
        &self,
        viewer: Option<UserId>,
        user_id: UserId,
        page: Option<usize>,
        size: Option<usize>,
    ) -> Result<OffsetPage<FollowRow>> {
        let total = self.store.count_followees(user_id).await?;
        let window = self.offset.window(page, size, total)?;
        let edges = self
            .store
            .followees(user_id, window.offset, window.page_size)
            .await?;
        let rows = self
            .follow_rows(viewer, edges, |follow| follow.followee_id)
            .await?;
        Ok(window.into_page(rows))
    }

    /// Wait for every background fan-out started so far.
    pub async fn drain_fanout(&self) -> Vec<FanoutReport> {
        let handles = std::mem::take(&mut *self.pending());
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => warn!("Background fan-out failed: {}", e),
                Err(e) => error!("Background fan-out task died: {}", e),
            }
        }
        reports
    }

    /// Recipients, by post, whose feed entry is still missing after every
    /// fan-out attempt so far.
    pub fn undelivered(&self) -> Vec<(PostId, Vec<UserId>)> {
        self.fanout.undelivered()
    }

    /// Re-deliver everything in [`FeedService::undelivered`].
    pub async fn retry_undelivered(&self) -> Vec<FanoutReport> {
        self.fanout.retry_undelivered().await
    }

    fn track(&self, handle: JoinHandle<Result<FanoutReport>>) {
        let mut pending = self.pending();
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
    }

    fn pending(&self) -> MutexGuard<'_, Vec<JoinHandle<Result<FanoutReport>>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Visible posts with their authors, keyed by post id. Missing (deleted)
    /// and hidden posts are left out.
    async fn render_posts(&self, post_ids: &[PostId]) -> Result<HashMap<PostId, PostView>> {
        let posts: Vec<Post> = self.objects.get_many(post_ids, self.store.as_ref()).await?;
        let posts: Vec<Post> = posts
            .into_iter()
            .filter(|post| post.status == PostStatus::Visible)
            .collect();

        let mut seen = HashSet::new();
        let author_ids: Vec<UserId> = posts
            .iter()
            .map(|post| post.author_id)
            .filter(|id| seen.insert(*id))
            .collect();
        let authors: HashMap<UserId, User> = self
            .objects
            .get_many::<User, _>(&author_ids, self.store.as_ref())
            .await?
            .into_iter()
            .map(|user| (user.id, user))
            .collect();

        Ok(posts
            .into_iter()
            .filter_map(|post| {
                let author = authors.get(&post.author_id)?.clone();
                Some((
                    post.id,
                    PostView {
                        id: post.id,
                        author,
                        body: post.body,
                        created_at: post.created_at,
                    },
                ))
            })
            .collect())
    }

    async fn follow_rows(
        &self,
        viewer: Option<UserId>,
        edges: Vec<Follow>,
        other: fn(&Follow) -> UserId,
    ) -> Result<Vec<FollowRow>> {
        let user_ids: Vec<UserId> = edges.iter().map(other).collect();
        let users: HashMap<UserId, User> = self
            .objects
            .get_many::<User, _>(&user_ids, self.store.as_ref())
            .await?
            .into_iter()
            .map(|user| (user.id, user))
            .collect();

        let memo = self.followings.memo(viewer, self.store.as_ref());
        let mut rows = Vec::with_capacity(edges.len());
        for edge in &edges {
            let Some(user) = users.get(&other(edge)) else {
                continue;
            };
            rows.push(FollowRow {
                has_followed: memo.has_followed(user.id).await?,
                user: user.clone(),
                created_at: edge.created_at,
            });
        }
        Ok(rows)
    }
}
