//! In-memory relational store.
//!
//! Reference implementation of [`FeedStore`] and [`SocialGraph`] used by
//! tests, benches and embedders without a database. It enforces the same
//! uniqueness constraints a relational schema would and fires mutation hooks
//! after each write commits.

use crate::error::{Error, Result};
use crate::invalidation::{InvalidationRegistry, Mutation};
use crate::model::{
    Cursor, FeedEntry, Follow, Post, PostId, PostRef, PostStatus, Record, User, UserId,
};
use crate::repository::{DataRepository, FeedStore, Inserted, SocialGraph};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
    users: HashMap<UserId, User>,
    usernames: HashMap<String, UserId>,
    posts: HashMap<PostId, Post>,
    posts_by_author: HashMap<UserId, BTreeMap<Cursor, PostRef>>,
    feed_entries: HashMap<(UserId, PostId), FeedEntry>,
    timelines: HashMap<UserId, BTreeMap<Cursor, FeedEntry>>,
    follows: HashMap<(UserId, UserId), Follow>,
    /// followee -> edges
    followers: HashMap<UserId, BTreeMap<Cursor, Follow>>,
    /// follower -> edges
    followees: HashMap<UserId, BTreeMap<Cursor, Follow>>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Strictly increasing commit clock.
    fn now(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now
    }
}

fn newest_first<T: Clone>(
    index: Option<&BTreeMap<Cursor, T>>,
    before: Option<Cursor>,
    limit: usize,
) -> Vec<T> {
    let Some(index) = index else {
        return Vec::new();
    };
    match before {
        Some(cursor) => index.range(..cursor).rev().take(limit).map(|(_, v)| v.clone()).collect(),
        None => index.values().rev().take(limit).cloned().collect(),
    }
}

/// Store backed by in-process tables.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    hooks: OnceLock<Arc<InvalidationRegistry>>,
    failing_recipients: Mutex<HashSet<UserId>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every feed-entry write for `recipient` fail until restored.
    pub fn fail_feed_writes_for(&self, recipient: UserId) {
        if let Ok(mut failing) = self.failing_recipients.lock() {
            failing.insert(recipient);
        }
    }

    pub fn restore_feed_writes_for(&self, recipient: UserId) {
        if let Ok(mut failing) = self.failing_recipients.lock() {
            failing.remove(&recipient);
        }
    }

    /// Number of feed entries referencing `post_id` across all timelines.
    pub async fn feed_entry_count_for_post(&self, post_id: PostId) -> usize {
        let tables = self.tables.read().await;
        tables
            .feed_entries
            .keys()
            .filter(|(_, post)| *post == post_id)
            .count()
    }

    pub async fn follow_count(&self) -> usize {
        self.tables.read().await.follows.len()
    }

    fn write_blocked(&self, recipient: UserId) -> bool {
        self.failing_recipients
            .lock()
            .map(|failing| failing.contains(&recipient))
            .unwrap_or(false)
    }

    /// Invoke hooks for a committed write.
    async fn emit(&self, mutation: Mutation, record: Record) {
        if let Some(registry) = self.hooks.get() {
            registry.dispatch(mutation, &record).await;
        }
    }
}

impl DataRepository<Post> for InMemoryStore {
    async fn fetch_by_id(&self, id: &PostId) -> Result<Option<Post>> {
        Ok(self.tables.read().await.posts.get(id).cloned())
    }
}

impl DataRepository<User> for InMemoryStore {
    async fn fetch_by_id(&self, id: &UserId) -> Result<Option<User>> {
        Ok(self.tables.read().await.users.get(id).cloned())
    }
}

impl FeedStore for InMemoryStore {
    fn install_hooks(&self, registry: Arc<InvalidationRegistry>) {
        if self.hooks.set(registry).is_err() {
            warn!("Mutation hooks already installed; ignoring second registry");
        }
    }

    async fn create_user(&self, username: &str) -> Result<User> {
        let user = {
            let mut tables = self.tables.write().await;
            if tables.usernames.contains_key(username) {
                return Err(Error::ValidationError(format!(
                    "username {} is taken",
                    username
                )));
            }
            let user = User {
                id: tables.next_id(),
                username: username.to_string(),
                display_name: username.to_string(),
                created_at: tables.now(),
            };
            tables.usernames.insert(user.username.clone(), user.id);
            tables.users.insert(user.id, user.clone());
            user
        };

        self.emit(Mutation::Created, Record::User(user.clone())).await;
        Ok(user)
    }

    async fn update_user(&self, id: UserId, display_name: &str) -> Result<Option<User>> {
        let updated = {
            let mut tables = self.tables.write().await;
            match tables.users.get_mut(&id) {
                Some(user) => {
                    user.display_name = display_name.to_string();
                    Some(user.clone())
                }
                None => None,
            }
        };

        if let Some(user) = &updated {
            self.emit(Mutation::Updated, Record::User(user.clone())).await;
        }
        Ok(updated)
    }

    async fn create_post(&self, author_id: UserId, body: &str) -> Result<Post> {
        let post = {
            let mut tables = self.tables.write().await;
            if !tables.users.contains_key(&author_id) {
                return Err(Error::not_found("user", author_id));
            }
            let post = Post {
                id: tables.next_id(),
                author_id,
                body: body.to_string(),
                status: PostStatus::Visible,
                created_at: tables.now(),
            };
            tables
                .posts_by_author
                .entry(author_id)
                .or_default()
                .insert(post.cursor(), post.to_ref());
            tables.posts.insert(post.id, post.clone());
            post
        };

        self.emit(Mutation::Created, Record::Post(post.clone())).await;
        Ok(post)
    }

    async fn set_post_status(&self, id: PostId, status: PostStatus) -> Result<Option<Post>> {
        let updated = {
            let mut tables = self.tables.write().await;
            match tables.posts.get_mut(&id) {
                Some(post) => {
                    post.status = status;
                    Some(post.clone())
                }
                None => None,
            }
        };

        if let Some(post) = &updated {
            self.emit(Mutation::Updated, Record::Post(post.clone())).await;
        }
        Ok(updated)
    }

    async fn delete_post(&self, id: PostId) -> Result<Option<Post>> {
        // Feed entries stay behind as tombstones; readers skip them.
        let removed = {
            let mut tables = self.tables.write().await;
            let removed = tables.posts.remove(&id);
            if let Some(post) = &removed {
                if let Some(index) = tables.posts_by_author.get_mut(&post.author_id) {
                    index.remove(&post.cursor());
                }
            }
            removed
        };

        if let Some(post) = &removed {
            self.emit(Mutation::Deleted, Record::Post(post.clone())).await;
        }
        Ok(removed)
    }

    async fn posts_by_author(
        &self,
        author_id: UserId,
        before: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<PostRef>> {
        let tables = self.tables.read().await;
        Ok(newest_first(
            tables.posts_by_author.get(&author_id),
            before,
            limit,
        ))
    }

    async fn insert_feed_entry(
        &self,
        recipient_id: UserId,
        post_id: PostId,
    ) -> Result<Inserted<FeedEntry>> {
        if self.write_blocked(recipient_id) {
            return Err(Error::RepositoryError(format!(
                "feed entry write rejected for recipient {}",
                recipient_id
            )));
        }

        let entry = {
            let mut tables = self.tables.write().await;
            if let Some(existing) = tables.feed_entries.get(&(recipient_id, post_id)) {
                return Ok(Inserted::Duplicate(existing.clone()));
            }
            if !tables.posts.contains_key(&post_id) {
                return Err(Error::not_found("post", post_id));
            }
            let entry = FeedEntry {
                id: tables.next_id(),
                recipient_id,
                post_id,
                created_at: tables.now(),
            };
            tables
                .feed_entries
                .insert((recipient_id, post_id), entry.clone());
            tables
                .timelines
                .entry(recipient_id)
                .or_default()
                .insert(Cursor::new(entry.created_at, entry.id), entry.clone());
            entry
        };

        self.emit(Mutation::Created, Record::FeedEntry(entry.clone()))
            .await;
        Ok(Inserted::Created(entry))
    }

    async fn feed_entries(
        &self,
        recipient_id: UserId,
        before: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<FeedEntry>> {
        let tables = self.tables.read().await;
        Ok(newest_first(tables.timelines.get(&recipient_id), before, limit))
    }

    async fn insert_follow(
        &self,
        follower_id: UserId,
        followee_id: UserId,
    ) -> Result<Inserted<Follow>> {
        let follow = {
            let mut tables = self.tables.write().await;
            if let Some(existing) = tables.follows.get(&(follower_id, followee_id)) {
                return Ok(Inserted::Duplicate(existing.clone()));
            }
            let follow = Follow {
                id: tables.next_id(),
                follower_id,
                followee_id,
                created_at: tables.now(),
            };
            tables
                .follows
                .insert((follower_id, followee_id), follow.clone());
            tables
                .followers
                .entry(followee_id)
                .or_default()
                .insert(follow.cursor(), follow.clone());
            tables
                .followees
                .entry(follower_id)
                .or_default()
                .insert(follow.cursor(), follow.clone());
            follow
        };

        self.emit(Mutation::Created, Record::Follow(follow.clone()))
            .await;
        Ok(Inserted::Created(follow))
    }

    async fn delete_follow(&self, follower_id: UserId, followee_id: UserId) -> Result<Option<Follow>> {
        let removed = {
            let mut tables = self.tables.write().await;
            let removed = tables.follows.remove(&(follower_id, followee_id));
            if let Some(follow) = &removed {
                if let Some(index) = tables.followers.get_mut(&followee_id) {
                    index.remove(&follow.cursor());
                }
                if let Some(index) = tables.followees.get_mut(&follower_id) {
                    index.remove(&follow.cursor());
                }
            }
            removed
        };

        if let Some(follow) = &removed {
            self.emit(Mutation::Deleted, Record::Follow(follow.clone()))
                .await;
        }
        Ok(removed)
    }
}

impl SocialGraph for InMemoryStore {
    async fn follower_ids(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .followers
            .get(&user_id)
            .map(|edges| edges.values().map(|f| f.follower_id).collect())
            .unwrap_or_default())
    }

    async fn followee_ids(&self, user_id: UserId) -> Result<Vec<UserId>> {
        let tables = self.tables.read().await;
        Ok(tables
            .followees
            .get(&user_id)
            .map(|edges| edges.values().map(|f| f.followee_id).collect())
            .unwrap_or_default())
    }

    async fn count_followers(&self, user_id: UserId) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables.followers.get(&user_id).map(BTreeMap::len).unwrap_or(0))
    }

    async fn count_followees(&self, user_id: UserId) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables.followees.get(&user_id).map(BTreeMap::len).unwrap_or(0))
    }

    async fn followers(&self, user_id: UserId, offset: usize, limit: usize) -> Result<Vec<Follow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .followers
            .get(&user_id)
            .map(|edges| edges.values().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn followees(&self, user_id: UserId, offset: usize, limit: usize) -> Result<Vec<Follow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .followees
            .get(&user_id)
            .map(|edges| edges.values().rev().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;

    #[tokio::test]
    async fn test_feed_entry_uniqueness() {
        let store = InMemoryStore::new();
        let author = store.create_user("author").await.unwrap();
        let reader = store.create_user("reader").await.unwrap();
        let post = store.create_post(author.id, "first post").await.unwrap();

        let first = store.insert_feed_entry(reader.id, post.id).await.unwrap();
        let second = store.insert_feed_entry(reader.id, post.id).await.unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.as_inner().id, second.as_inner().id);
        assert_eq!(store.feed_entry_count_for_post(post.id).await, 1);
    }

    #[tokio::test]
    async fn test_feed_entries_newest_first_with_cursor() {
        let store = InMemoryStore::new();
        let author = store.create_user("author").await.unwrap();
        let mut entries = Vec::new();
        for i in 0..5 {
            let post = store
                .create_post(author.id, &format!("post number {}", i))
                .await
                .unwrap();
            entries.push(
                store
                    .insert_feed_entry(author.id, post.id)
                    .await
                    .unwrap()
                    .into_inner(),
            );
        }

        let page = store.feed_entries(author.id, None, 2).await.unwrap();
        assert_eq!(page, vec![entries[4].clone(), entries[3].clone()]);

        let cursor = Cursor::new(entries[3].created_at, entries[3].id);
        let older = store.feed_entries(author.id, Some(cursor), 10).await.unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older[0].id, entries[2].id);
    }

    #[tokio::test]
    async fn test_follow_uniqueness_and_indexes() {
        let store = InMemoryStore::new();
        let a = store.create_user("a").await.unwrap();
        let b = store.create_user("b").await.unwrap();

        assert!(store.insert_follow(a.id, b.id).await.unwrap().is_created());
        assert!(!store.insert_follow(a.id, b.id).await.unwrap().is_created());
        assert_eq!(store.follow_count().await, 1);

        assert_eq!(store.follower_ids(b.id).await.unwrap(), vec![a.id]);
        assert_eq!(store.followee_ids(a.id).await.unwrap(), vec![b.id]);
        assert_eq!(store.count_followers(b.id).await.unwrap(), 1);

        assert!(store.delete_follow(a.id, b.id).await.unwrap().is_some());
        assert!(store.delete_follow(a.id, b.id).await.unwrap().is_none());
        assert_eq!(store.count_followers(b.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryStore::new();
        let author = store.create_user("author").await.unwrap();
        let post = store.create_post(author.id, "hello world").await.unwrap();

        store.fail_feed_writes_for(author.id);
        assert!(store.insert_feed_entry(author.id, post.id).await.is_err());

        store.restore_feed_writes_for(author.id);
        assert!(store.insert_feed_entry(author.id, post.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_hooks_fire_after_commit() {
        let store = Arc::new(InMemoryStore::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let hook_store = Arc::clone(&store);
        let hook_seen = Arc::clone(&seen);
        let registry = InvalidationRegistry::builder()
            .on(EntityKind::Post, Mutation::Updated, move |record| {
                let store = Arc::clone(&hook_store);
                let seen = Arc::clone(&hook_seen);
                async move {
                    // The committed row must already be readable.
                    let current = DataRepository::<Post>::fetch_by_id(&*store, &record.id())
                        .await?
                        .map(|p| p.status);
                    seen.lock().expect("lock").push(current);
                    Ok(())
                }
            })
            .build();
        store.install_hooks(Arc::new(registry));

        let author = store.create_user("author").await.unwrap();
        let post = store.create_post(author.id, "hello world").await.unwrap();
        store
            .set_post_status(post.id, PostStatus::Hidden)
            .await
            .unwrap();

        assert_eq!(*seen.lock().expect("lock"), vec![Some(PostStatus::Hidden)]);
    }

    #[tokio::test]
    async fn test_create_post_requires_author() {
        let store = InMemoryStore::new();
        let err = store.create_post(404, "orphan post").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
