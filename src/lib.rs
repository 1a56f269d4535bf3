//! # feed-kit
//!
//! Push-model timeline fan-out with read-through caching for social feeds.
//!
//! ## Features
//!
//! - **Fan-out on write:** a new post is written once per follower, in a
//!   detached task with bounded concurrency and per-recipient retries
//! - **Bounded list cache:** timelines and author post lists kept newest-first,
//!   capped at a configurable bound, pushed to atomically
//! - **Object cache:** read-through post and user lookups, evicted on write
//! - **Invalidation registry:** explicit `(entity, mutation) -> listeners`
//!   bindings run after each committed write
//! - **Pagination:** endless (cursor) pages that fall back to the store past
//!   the cache horizon, and offset pages for follower listings
//! - **Fail-open:** every cache call is time-bounded; an unreachable cache
//!   degrades to store reads
//!
//! ## Quick Start
//!
//! ```ignore
//! use feed_kit::{
//!     backend::InMemoryBackend, EndlessRequest, FeedConfig, FeedService, InMemoryStore,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let service = FeedService::new(store, InMemoryBackend::new(), FeedConfig::from_env())?;
//!
//! let alice = service.register_user("alice").await?;
//! let bob = service.register_user("bob").await?;
//! service.follow(bob.id, alice.id).await?;
//!
//! service.publish(alice.id, "hello, world").await?;
//! service.drain_fanout().await;
//!
//! let page = service.timeline(bob.id, &EndlessRequest::first()).await?;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod entity;
pub mod error;
pub mod fanout;
pub mod invalidation;
pub mod key;
pub mod list_cache;
pub mod model;
pub mod object_cache;
pub mod observability;
pub mod pagination;
pub mod repository;
pub mod serialization;
pub mod service;
pub mod social;
pub mod store;
pub mod strategy;

// Re-exports for convenience
pub use backend::{CacheBackend, ListPush};
pub use config::{FanoutMode, FeedConfig};
pub use entity::CacheEntity;
pub use error::{Error, Result};
pub use fanout::{FanoutEngine, FanoutReport, FanoutTask};
pub use invalidation::{InvalidationRegistry, Mutation};
pub use key::{CacheKeyBuilder, ListKey};
pub use list_cache::{ListCache, Listed};
pub use model::{Cursor, EntityKind, FeedEntry, Follow, Post, PostStatus, Record, User};
pub use object_cache::ObjectCache;
pub use pagination::{EndlessRequest, OffsetPage, Page, PageSource};
pub use repository::{DataRepository, FeedStore, Inserted, SocialGraph};
pub use service::FeedService;
pub use social::{FollowingMemo, FollowingSet, FollowingSetCache};
pub use store::InMemoryStore;
pub use strategy::CacheStrategy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
