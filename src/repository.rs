//! Contracts of the relational store and the social-graph reader.
//!
//! The store is the source of truth; caches only ever mirror it. Stores
//! enforce uniqueness of `(recipient, post)` feed entries and
//! `(follower, followee)` follows, and report violations as
//! [`Inserted::Duplicate`] rather than as errors.

use crate::entity::CacheEntity;
use crate::error::Result;
use crate::invalidation::InvalidationRegistry;
use crate::model::{Cursor, FeedEntry, Follow, Post, PostId, PostRef, PostStatus, User, UserId};
use std::future::Future;
use std::sync::Arc;

/// Primary-key lookup used by the object cache on a miss.
pub trait DataRepository<T: CacheEntity>: Send + Sync {
    fn fetch_by_id(&self, id: &T::Key) -> impl Future<Output = Result<Option<T>>> + Send;
}

/// Result of a uniqueness-constrained insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inserted<T> {
    Created(T),
    /// The row already existed; carries the existing row.
    Duplicate(T),
}

impl<T> Inserted<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, Inserted::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Inserted::Created(row) | Inserted::Duplicate(row) => row,
        }
    }

    pub fn as_inner(&self) -> &T {
        match self {
            Inserted::Created(row) | Inserted::Duplicate(row) => row,
        }
    }
}

/// Relational store operations the feed subsystem depends on.
///
/// Every mutating call commits first and only then invokes the hooks
/// installed with [`FeedStore::install_hooks`].
pub trait FeedStore: DataRepository<Post> + DataRepository<User> + Send + Sync + 'static {
    /// Attach the invalidation registry. Called once at startup.
    fn install_hooks(&self, registry: Arc<InvalidationRegistry>);

    fn create_user(&self, username: &str) -> impl Future<Output = Result<User>> + Send;

    fn update_user(
        &self,
        id: UserId,
        display_name: &str,
    ) -> impl Future<Output = Result<Option<User>>> + Send;

    fn create_post(&self, author_id: UserId, body: &str)
        -> impl Future<Output = Result<Post>> + Send;

    fn set_post_status(
        &self,
        id: PostId,
        status: PostStatus,
    ) -> impl Future<Output = Result<Option<Post>>> + Send;

    fn delete_post(&self, id: PostId) -> impl Future<Output = Result<Option<Post>>> + Send;

    /// Newest-first posts of `author` strictly older than `before`.
    fn posts_by_author(
        &self,
        author_id: UserId,
        before: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PostRef>>> + Send;

    /// Idempotent insert of one feed entry.
    fn insert_feed_entry(
        &self,
        recipient_id: UserId,
        post_id: PostId,
    ) -> impl Future<Output = Result<Inserted<FeedEntry>>> + Send;

    /// Newest-first entries on `recipient`'s timeline strictly older than
    /// `before`.
    fn feed_entries(
        &self,
        recipient_id: UserId,
        before: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<FeedEntry>>> + Send;

    /// Idempotent insert of a follow edge.
    fn insert_follow(
        &self,
        follower_id: UserId,
        followee_id: UserId,
    ) -> impl Future<Output = Result<Inserted<Follow>>> + Send;

    /// Remove a follow edge, returning it if it existed.
    fn delete_follow(
        &self,
        follower_id: UserId,
        followee_id: UserId,
    ) -> impl Future<Output = Result<Option<Follow>>> + Send;
}

/// Read contract of the social graph.
pub trait SocialGraph: Send + Sync + 'static {
    /// Everyone following `user_id`.
    fn follower_ids(&self, user_id: UserId) -> impl Future<Output = Result<Vec<UserId>>> + Send;

    /// Everyone `user_id` follows.
    fn followee_ids(&self, user_id: UserId) -> impl Future<Output = Result<Vec<UserId>>> + Send;

    fn count_followers(&self, user_id: UserId) -> impl Future<Output = Result<usize>> + Send;

    fn count_followees(&self, user_id: UserId) -> impl Future<Output = Result<usize>> + Send;

    /// Newest-first follow edges pointing at `user_id`.
    fn followers(
        &self,
        user_id: UserId,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Follow>>> + Send;

    /// Newest-first follow edges starting at `user_id`.
    fn followees(
        &self,
        user_id: UserId,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Follow>>> + Send;
}
