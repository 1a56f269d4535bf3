//! Canonical records, list references and rendered views.

use crate::entity::CacheEntity;
use crate::list_cache::Listed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = u64;
pub type PostId = u64;
pub type FeedEntryId = u64;
pub type FollowId = u64;

/// Position in a reverse-chronological list.
///
/// Ordered by creation time, ties broken by id, so "older than" is strict
/// even when two rows share a timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: u64,
}

impl Cursor {
    pub fn new(created_at: DateTime<Utc>, id: u64) -> Self {
        Cursor { created_at, id }
    }

    /// Sort score used by cache-store list primitives (microseconds).
    pub fn score(&self) -> i64 {
        self.created_at.timestamp_micros()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl CacheEntity for User {
    type Key = UserId;

    fn cache_key(&self) -> Self::Key {
        self.id
    }

    fn cache_prefix() -> &'static str {
        "user"
    }
}

/// Moderation state; the only mutable part of a post.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PostStatus {
    #[default]
    Visible,
    Hidden,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub body: String,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }

    pub fn to_ref(&self) -> PostRef {
        PostRef {
            id: self.id,
            created_at: self.created_at,
        }
    }
}

impl CacheEntity for Post {
    type Key = PostId;

    fn cache_key(&self) -> Self::Key {
        self.id
    }

    fn cache_prefix() -> &'static str {
        "post"
    }
}

/// "This post appears on this user's timeline."
///
/// `recipient_id` is the timeline owner, not the author. `created_at` is the
/// feed store's clock, independent of the post's own timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: FeedEntryId,
    pub recipient_id: UserId,
    pub post_id: PostId,
    pub created_at: DateTime<Utc>,
}

impl Listed for FeedEntry {
    fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }
}

/// Lightweight reference kept in an author's post list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    pub id: PostId,
    pub created_at: DateTime<Utc>,
}

impl Listed for PostRef {
    fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    pub id: FollowId,
    pub follower_id: UserId,
    pub followee_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Follow {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }
}

/// Entity types that take part in mutation hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Post,
    User,
    Follow,
    FeedEntry,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Post => write!(f, "post"),
            EntityKind::User => write!(f, "user"),
            EntityKind::Follow => write!(f, "follow"),
            EntityKind::FeedEntry => write!(f, "feed_entry"),
        }
    }
}

/// A mutated row as handed to invalidation listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Post(Post),
    User(User),
    Follow(Follow),
    FeedEntry(FeedEntry),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Post(_) => EntityKind::Post,
            Record::User(_) => EntityKind::User,
            Record::Follow(_) => EntityKind::Follow,
            Record::FeedEntry(_) => EntityKind::FeedEntry,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Record::Post(post) => post.id,
            Record::User(user) => user.id,
            Record::Follow(follow) => follow.id,
            Record::FeedEntry(entry) => entry.id,
        }
    }
}

/// Post denormalized with its author.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PostView {
    pub id: PostId,
    pub author: User,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// One rendered row of a timeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TimelineItem {
    pub entry_id: FeedEntryId,
    pub created_at: DateTime<Utc>,
    pub post: PostView,
}

impl TimelineItem {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.entry_id)
    }
}

/// One row of a follower/following listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FollowRow {
    pub user: User,
    pub created_at: DateTime<Utc>,
    /// Whether the viewer follows `user`.
    pub has_followed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cursor_orders_by_time_then_id() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(1_700_000_001, 0).unwrap();

        assert!(Cursor::new(t0, 9) < Cursor::new(t1, 1));
        assert!(Cursor::new(t0, 1) < Cursor::new(t0, 2));
        assert_eq!(Cursor::new(t1, 0).score(), 1_700_000_001_000_000);
    }

    #[test]
    fn test_record_kind() {
        let follow = Follow {
            id: 3,
            follower_id: 1,
            followee_id: 2,
            created_at: Utc::now(),
        };
        let record = Record::Follow(follow);
        assert_eq!(record.kind(), EntityKind::Follow);
        assert_eq!(record.id(), 3);
        assert_eq!(EntityKind::FeedEntry.to_string(), "feed_entry");
    }

    #[test]
    fn test_post_cache_identity() {
        let post = Post {
            id: 11,
            author_id: 1,
            body: "hello world".into(),
            status: PostStatus::Visible,
            created_at: Utc::now(),
        };
        assert_eq!(post.cache_key(), 11);
        assert_eq!(Post::cache_prefix(), "post");
        assert_eq!(post.to_ref().cursor(), post.cursor());
    }
}
