//! Invalidation listeners bound to store mutations.
//!
//! The registry is built once at startup and is immutable afterwards. Stores
//! call [`InvalidationRegistry::dispatch`] after a write has committed; a
//! listener that ran before the commit could let a concurrent reader
//! repopulate the cache with the pre-write row, which nothing would evict.
//!
//! Listeners reach caches only through the narrow [`ObjectInvalidator`] and
//! [`FollowingInvalidator`] seams, so this module depends on no cache type.

use crate::error::Result;
use crate::model::{EntityKind, Record, UserId};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Kind of store mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mutation {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Created => write!(f, "created"),
            Mutation::Updated => write!(f, "updated"),
            Mutation::Deleted => write!(f, "deleted"),
        }
    }
}

/// Something that can evict a cached record.
pub trait ObjectInvalidator: Send + Sync + 'static {
    fn invalidate_object(&self, kind: EntityKind, id: u64) -> BoxFuture<'_, Result<()>>;
}

/// Something that can evict a user's cached following set.
pub trait FollowingInvalidator: Send + Sync + 'static {
    fn invalidate_following(&self, user_id: UserId) -> BoxFuture<'_, Result<()>>;
}

/// A registered callback.
pub type Listener = Arc<dyn Fn(Record) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Maps `(entity kind, mutation)` to an ordered list of listeners.
#[derive(Default)]
pub struct InvalidationRegistry {
    listeners: HashMap<(EntityKind, Mutation), Vec<Listener>>,
}

impl fmt::Debug for InvalidationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bindings: Vec<String> = self
            .listeners
            .iter()
            .map(|((kind, mutation), list)| format!("{}:{}x{}", kind, mutation, list.len()))
            .collect();
        bindings.sort();
        f.debug_struct("InvalidationRegistry")
            .field("bindings", &bindings)
            .finish()
    }
}

impl InvalidationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Number of listeners bound to `(kind, mutation)`.
    pub fn listener_count(&self, kind: EntityKind, mutation: Mutation) -> usize {
        self.listeners
            .get(&(kind, mutation))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Run every listener bound to the record's kind and `mutation`, in
    /// registration order.
    ///
    /// The write has already committed, so a failing listener is logged and
    /// skipped; the return value is the number of failures.
    pub async fn dispatch(&self, mutation: Mutation, record: &Record) -> usize {
        let kind = record.kind();
        let Some(listeners) = self.listeners.get(&(kind, mutation)) else {
            return 0;
        };

        debug!(
            "» Dispatching {} {} #{} to {} listener(s)",
            kind,
            mutation,
            record.id(),
            listeners.len()
        );

        let mut failures = 0;
        for listener in listeners {
            if let Err(e) = listener(record.clone()).await {
                failures += 1;
                warn!(
                    "Invalidation listener failed for {} {} #{}: {}",
                    kind,
                    mutation,
                    record.id(),
                    e
                );
            }
        }
        failures
    }
}

/// Builder populating an [`InvalidationRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    listeners: HashMap<(EntityKind, Mutation), Vec<Listener>>,
}

impl RegistryBuilder {
    /// Bind `listener` to `(kind, mutation)`.
    pub fn on<F, Fut>(mut self, kind: EntityKind, mutation: Mutation, listener: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |record| listener(record).boxed());
        self.listeners
            .entry((kind, mutation))
            .or_default()
            .push(listener);
        self
    }

    /// Bind the same listener to several mutations of one kind.
    pub fn on_each<F, Fut>(mut self, kind: EntityKind, mutations: &[Mutation], listener: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |record| listener(record).boxed());
        for mutation in mutations {
            self.listeners
                .entry((kind, *mutation))
                .or_default()
                .push(Arc::clone(&listener));
        }
        self
    }

    pub fn build(self) -> InvalidationRegistry {
        InvalidationRegistry {
            listeners: self.listeners,
        }
    }
}

const ALL_MUTATIONS: [Mutation; 3] = [Mutation::Created, Mutation::Updated, Mutation::Deleted];

/// Default cache bindings.
///
/// - any Post or User mutation evicts that record from the object cache;
/// - a Follow created or deleted evicts the follower's following set.
pub fn register_cache_listeners(
    builder: RegistryBuilder,
    objects: Arc<dyn ObjectInvalidator>,
    followings: Arc<dyn FollowingInvalidator>,
) -> RegistryBuilder {
    let mut builder = builder;

    for kind in [EntityKind::Post, EntityKind::User] {
        let objects = Arc::clone(&objects);
        builder = builder.on_each(kind, &ALL_MUTATIONS, move |record: Record| {
            let objects = Arc::clone(&objects);
            async move { objects.invalidate_object(record.kind(), record.id()).await }
        });
    }

    builder.on_each(
        EntityKind::Follow,
        &[Mutation::Created, Mutation::Deleted],
        move |record: Record| {
            let followings = Arc::clone(&followings);
            async move {
                match record {
                    Record::Follow(follow) => {
                        followings.invalidate_following(follow.follower_id).await
                    }
                    _ => Ok(()),
                }
            }
        },
    )
}
