//! Push-model fan-out of new posts into follower timelines.
//!
//! Everything after the post row commits runs on one detached task: the
//! author's own entry first, then every follower. The publishing request
//! only waits for the author's entry, so dropping it never strands a
//! committed post. Recipients still missing an entry after all retries are
//! kept in a ledger until a later retry delivers them.

use crate::backend::CacheBackend;
use crate::config::FeedConfig;
use crate::error::Result;
use crate::key::ListKey;
use crate::list_cache::ListCache;
use crate::model::{FeedEntry, Post, PostId, UserId};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::repository::{DataRepository, FeedStore, Inserted, SocialGraph};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Outcome of one fan-out pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub post_id: PostId,
    /// Recipients that got a new feed entry.
    pub delivered: usize,
    /// Recipients that already had the entry.
    pub duplicates: usize,
    /// Recipients whose feed entry could not be written after all retries.
    pub failed: Vec<UserId>,
}

impl FanoutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn recipients(&self) -> usize {
        self.delivered + self.duplicates + self.failed.len()
    }

    fn count(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Created => self.delivered += 1,
            Delivery::Duplicate => self.duplicates += 1,
            Delivery::Failed(recipient) => self.failed.push(recipient),
        }
    }
}

enum Delivery {
    Created,
    Duplicate,
    Failed(UserId),
}

impl Delivery {
    fn of(recipient: UserId, outcome: &Result<Inserted<FeedEntry>>) -> Self {
        match outcome {
            Ok(Inserted::Created(_)) => Delivery::Created,
            Ok(Inserted::Duplicate(_)) => Delivery::Duplicate,
            Err(_) => Delivery::Failed(recipient),
        }
    }
}

/// Detached delivery of one committed post.
pub struct FanoutTask {
    /// Resolves to `true` once the author's own entry is written, `false`
    /// if that write failed.
    pub author_delivered: oneshot::Receiver<bool>,
    /// Report covering the author and every follower.
    pub handle: JoinHandle<Result<FanoutReport>>,
}

/// Writes feed entries for a post and pushes them into cached timelines.
pub struct FanoutEngine<S, B>
where
    S: FeedStore + SocialGraph,
    B: CacheBackend,
{
    store: Arc<S>,
    lists: Arc<ListCache<B>>,
    concurrency: usize,
    retries: u32,
    backoff: Duration,
    metrics: Arc<dyn CacheMetrics>,
    undelivered: Mutex<BTreeMap<PostId, BTreeSet<UserId>>>,
}

impl<S, B> FanoutEngine<S, B>
where
    S: FeedStore + SocialGraph,
    B: CacheBackend,
{
    pub fn new(store: Arc<S>, lists: Arc<ListCache<B>>, config: &FeedConfig) -> Self {
        FanoutEngine {
            store,
            lists,
            concurrency: config.fanout_concurrency.max(1),
            retries: config.fanout_retries,
            backoff: config.fanout_backoff,
            metrics: Arc::new(NoOpMetrics),
            undelivered: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Put `post` on its author's authored-posts list and own timeline.
    ///
    /// The post row must already be committed. A failed timeline write is
    /// recorded as undelivered.
    pub async fn deliver_to_author(&self, post: &Post) -> Result<Inserted<FeedEntry>> {
        let authored = ListKey::user_posts(post.author_id);
        if let Err(e) = self.lists.push(&authored, &post.to_ref()).await {
            debug!("Skipped cache push to {}: {}", authored, e);
        }

        let outcome = self.deliver_with_retry(post, post.author_id).await;
        let author = [post.author_id];
        let failed = if outcome.is_err() { &author[..] } else { &[] };
        self.record(post.id, &author, failed);
        outcome
    }

    /// Deliver `post` to every current follower of its author.
    ///
    /// The follower set is read once; users who follow later do not get
    /// this post. Recipients are written independently, so one failing
    /// recipient never blocks the rest.
    ///
    /// # Errors
    ///
    /// Only when the follower set itself cannot be read.
    pub async fn fan_out(&self, post: &Post) -> Result<FanoutReport> {
        let followers = self.store.follower_ids(post.author_id).await?;
        let recipients: Vec<UserId> = followers
            .into_iter()
            .filter(|id| *id != post.author_id)
            .collect();

        debug!(
            "» Fanning out post {} to {} follower(s)",
            post.id,
            recipients.len()
        );
        Ok(self.deliver_all(post, recipients).await)
    }

    /// Re-deliver `post` to specific recipients, e.g. the `failed` list of
    /// an earlier report.
    pub async fn retry(&self, post: &Post, recipients: &[UserId]) -> FanoutReport {
        info!(
            "» Retrying post {} for {} recipient(s)",
            post.id,
            recipients.len()
        );
        self.deliver_all(post, recipients.to_vec()).await
    }

    /// Recipients still missing their feed entry, by post.
    pub fn undelivered(&self) -> Vec<(PostId, Vec<UserId>)> {
        self.ledger()
            .iter()
            .map(|(post_id, recipients)| (*post_id, recipients.iter().copied().collect()))
            .collect()
    }

    /// Retry every undelivered recipient. Posts deleted in the meantime are
    /// dropped from the ledger.
    pub async fn retry_undelivered(&self) -> Vec<FanoutReport> {
        let mut reports = Vec::new();
        for (post_id, recipients) in self.undelivered() {
            match DataRepository::<Post>::fetch_by_id(self.store.as_ref(), &post_id).await {
                Ok(Some(post)) => reports.push(self.retry(&post, &recipients).await),
                Ok(None) => {
                    debug!("Post {} is gone, dropping its undelivered entries", post_id);
                    self.ledger().remove(&post_id);
                }
                Err(e) => warn!("Cannot load post {} for retry: {}", post_id, e),
            }
        }
        reports
    }

    /// Run the whole post-commit delivery on a detached task: the author's
    /// own entry, then [`FanoutEngine::fan_out`].
    ///
    /// The task is not tied to the caller: dropping the returned handles
    /// leaves it running to completion.
    pub fn spawn(self: &Arc<Self>, post: Post) -> FanoutTask {
        let engine = Arc::clone(self);
        let (signal, author_delivered) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let own = engine.deliver_to_author(&post).await;
            // The publisher may have gone away; delivery carries on regardless.
            let _ = signal.send(own.is_ok());

            let mut report = match engine.fan_out(&post).await {
                Ok(report) => report,
                Err(e) => {
                    error!("Fan-out of post {} aborted: {}", post.id, e);
                    return Err(e);
                }
            };
            report.count(Delivery::of(post.author_id, &own));
            report.failed.sort_unstable();
            Ok(report)
        });

        FanoutTask {
            author_delivered,
            handle,
        }
    }

    async fn deliver_all(&self, post: &Post, recipients: Vec<UserId>) -> FanoutReport {
        let timer = Instant::now();
        let total = recipients.len();

        let outcomes: Vec<Delivery> = stream::iter(recipients.iter().copied())
            .map(|recipient| async move {
                let outcome = self.deliver_with_retry(post, recipient).await;
                Delivery::of(recipient, &outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = FanoutReport {
            post_id: post.id,
            ..FanoutReport::default()
        };
        for outcome in outcomes {
            report.count(outcome);
        }
        report.failed.sort_unstable();
        self.record(post.id, &recipients, &report.failed);

        self.metrics
            .record_fanout(total, report.failed.len(), timer.elapsed());
        if report.is_complete() {
            info!(
                "✓ Fan-out of post {}: {} delivered, {} duplicate(s) in {:?}",
                post.id,
                report.delivered,
                report.duplicates,
                timer.elapsed()
            );
        } else {
            warn!(
                "Partial fan-out of post {}: {} delivered, {} failed {:?}",
                post.id,
                report.delivered,
                report.failed.len(),
                report.failed
            );
        }
        report
    }

    /// Settle the ledger for `post_id` after a delivery pass over `attempted`.
    fn record(&self, post_id: PostId, attempted: &[UserId], failed: &[UserId]) {
        let mut ledger = self.ledger();
        let pending = ledger.entry(post_id).or_default();
        for recipient in attempted {
            pending.remove(recipient);
        }
        pending.extend(failed.iter().copied());
        if pending.is_empty() {
            ledger.remove(&post_id);
        }
    }

    fn ledger(&self) -> MutexGuard<'_, BTreeMap<PostId, BTreeSet<UserId>>> {
        self.undelivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write one feed entry, retrying with exponential backoff.
    async fn deliver_with_retry(&self, post: &Post, recipient: UserId) -> Result<Inserted<FeedEntry>> {
        let max_attempts = self.retries + 1;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.deliver(post, recipient).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempts >= max_attempts => {
                    error!(
                        "Feed entry for post {} -> user {} failed after {} attempt(s): {}",
                        post.id, recipient, attempts, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Feed entry for post {} -> user {} failed (attempt {}/{}), retrying: {}",
                        post.id, recipient, attempts, max_attempts, e
                    );
                    tokio::time::sleep(self.backoff * 2_u32.pow(attempts - 1)).await;
                }
            }
        }
    }

    /// Store write, then cache push. The push runs for duplicates too, since
    /// an earlier attempt may have written the row but missed the cache.
    async fn deliver(&self, post: &Post, recipient: UserId) -> Result<Inserted<FeedEntry>> {
        let inserted = self.store.insert_feed_entry(recipient, post.id).await?;

        let timeline = ListKey::timeline(recipient);
        if let Err(e) = self.lists.push(&timeline, inserted.as_inner()).await {
            debug!("Skipped cache push to {}: {}", timeline, e);
        }
        Ok(inserted)
    }
}
