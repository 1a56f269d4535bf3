//! End-to-end timeline scenarios over the in-memory store and backend.

use feed_kit::backend::InMemoryBackend;
use feed_kit::error::{Error, Result};
use feed_kit::{
    CacheBackend, EndlessRequest, FanoutMode, FeedConfig, FeedEntry, FeedService, InMemoryStore,
    ListKey, ListPush, PageSource, PostStatus, User,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

type Service = FeedService<InMemoryStore, InMemoryBackend>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> FeedConfig {
    FeedConfig {
        fanout_mode: FanoutMode::Inline,
        fanout_retries: 0,
        fanout_backoff: Duration::from_millis(1),
        ..FeedConfig::default()
    }
}

fn service_with(config: FeedConfig) -> Service {
    init_logging();
    FeedService::new(Arc::new(InMemoryStore::new()), InMemoryBackend::new(), config)
        .expect("Failed to build service")
}

async fn users<B: CacheBackend>(svc: &FeedService<InMemoryStore, B>, names: &[&str]) -> Vec<User> {
    let mut out = Vec::new();
    for name in names {
        out.push(svc.register_user(name).await.expect("Failed to register"));
    }
    out
}

#[tokio::test]
async fn one_feed_entry_per_follower_and_author() {
    let svc = service_with(config());
    let people = users(&svc, &["author", "f1", "f2", "f3"]).await;
    let author = &people[0];
    for follower in &people[1..] {
        svc.follow(follower.id, author.id).await.unwrap();
    }

    let post = svc.publish(author.id, "one entry each").await.unwrap();
    assert_eq!(svc.store().feed_entry_count_for_post(post.id).await, 4);

    // Re-running the whole fan-out only finds duplicates.
    let report = svc.fanout_engine().fan_out(&post).await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.duplicates, 3);
    assert_eq!(svc.store().feed_entry_count_for_post(post.id).await, 4);
}

#[tokio::test]
async fn unfollow_stops_future_fan_out() {
    let svc = service_with(config());
    let people = users(&svc, &["alice", "f1", "f2"]).await;
    let (a, f1, f2) = (&people[0], &people[1], &people[2]);
    svc.follow(f1.id, a.id).await.unwrap();
    svc.follow(f2.id, a.id).await.unwrap();

    let p1 = svc.publish(a.id, "first post here").await.unwrap();
    for reader in [f1, f2] {
        let page = svc.timeline(reader.id, &EndlessRequest::first()).await.unwrap();
        assert_eq!(page.items[0].post.id, p1.id);
    }

    assert!(svc.unfollow(f1.id, a.id).await.unwrap());
    let p2 = svc.publish(a.id, "second post here").await.unwrap();

    let f1_page = svc.timeline(f1.id, &EndlessRequest::first()).await.unwrap();
    let f1_posts: Vec<u64> = f1_page.items.iter().map(|i| i.post.id).collect();
    assert_eq!(f1_posts, vec![p1.id]);

    let f2_page = svc.timeline(f2.id, &EndlessRequest::first()).await.unwrap();
    let f2_posts: Vec<u64> = f2_page.items.iter().map(|i| i.post.id).collect();
    assert_eq!(f2_posts, vec![p2.id, p1.id]);
}

#[tokio::test]
async fn duplicate_follow_is_reported_not_raised() {
    let svc = service_with(config());
    let people = users(&svc, &["a", "b"]).await;
    let (a, b) = (&people[0], &people[1]);

    let (first, second) = tokio::join!(svc.follow(a.id, b.id), svc.follow(a.id, b.id));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_created()).count(), 1);
    assert_eq!(svc.store().follow_count().await, 1);
}

#[tokio::test]
async fn endless_pages_cover_the_list_exactly_once() {
    let svc = service_with(config());
    let people = users(&svc, &["author", "reader"]).await;
    let (author, reader) = (&people[0], &people[1]);
    svc.follow(reader.id, author.id).await.unwrap();
    for i in 0..10 {
        svc.publish(author.id, &format!("post number {}", i)).await.unwrap();
    }

    let first = svc
        .timeline(reader.id, &EndlessRequest::first().with_page_size(5))
        .await
        .unwrap();
    assert_eq!(first.items.len(), 5);
    assert!(first.has_next);

    let cursor = first.next_cursor.expect("cursor after a full page");
    let second = svc
        .timeline(reader.id, &EndlessRequest::older_than(cursor).with_page_size(5))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 5);

    let cursor = second.next_cursor.expect("cursor after a full page");
    let third = svc
        .timeline(reader.id, &EndlessRequest::older_than(cursor).with_page_size(5))
        .await
        .unwrap();
    assert!(third.items.is_empty());
    assert!(!third.has_next);

    let ids: HashSet<u64> = first
        .items
        .iter()
        .chain(&second.items)
        .map(|item| item.entry_id)
        .collect();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn pagination_reads_past_the_cache_horizon() {
    let svc = service_with(FeedConfig {
        list_bound: 5,
        ..config()
    });
    let people = users(&svc, &["author", "reader"]).await;
    let (author, reader) = (&people[0], &people[1]);
    svc.follow(reader.id, author.id).await.unwrap();
    for i in 0..12 {
        svc.publish(author.id, &format!("post number {}", i)).await.unwrap();
    }

    let mut request = EndlessRequest::first().with_page_size(3);
    let mut seen = Vec::new();
    let mut sources = Vec::new();
    loop {
        let page = svc.timeline(reader.id, &request).await.unwrap();
        sources.push(page.source);
        seen.extend(page.items.iter().map(|item| item.entry_id));
        match (page.has_next, page.next_cursor) {
            (true, Some(cursor)) => {
                request = EndlessRequest::older_than(cursor).with_page_size(3)
            }
            _ => break,
        }
    }

    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 12);
    assert_eq!(unique.len(), 12);
    assert!(sources.contains(&PageSource::CacheBacked));
    assert!(sources.contains(&PageSource::StoreFallback));

    let cached = svc
        .list_cache()
        .peek::<FeedEntry>(&ListKey::timeline(reader.id))
        .await
        .unwrap()
        .expect("timeline is warm");
    assert_eq!(cached.len(), 5);
}

#[tokio::test]
async fn new_post_is_pushed_to_the_head_of_a_warm_timeline() {
    let svc = service_with(config());
    let people = users(&svc, &["author", "reader"]).await;
    let (author, reader) = (&people[0], &people[1]);
    svc.follow(reader.id, author.id).await.unwrap();
    svc.publish(author.id, "an older post").await.unwrap();

    // Warm the reader's timeline.
    svc.timeline(reader.id, &EndlessRequest::first()).await.unwrap();

    let newest = svc.publish(author.id, "a brand new post").await.unwrap();
    let page = svc.timeline(reader.id, &EndlessRequest::first()).await.unwrap();
    assert_eq!(page.source, PageSource::CacheBacked);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0].post.id, newest.id);
}

#[tokio::test]
async fn edits_are_visible_after_invalidation() {
    let svc = service_with(config());
    let people = users(&svc, &["author", "reader"]).await;
    let (author, reader) = (&people[0], &people[1]);
    svc.follow(reader.id, author.id).await.unwrap();
    let post = svc.publish(author.id, "hello from author").await.unwrap();

    let before = svc.timeline(reader.id, &EndlessRequest::first()).await.unwrap();
    assert_eq!(before.items[0].post.author.display_name, "author");

    svc.update_user(author.id, "The Author").await.unwrap();
    let after = svc.timeline(reader.id, &EndlessRequest::first()).await.unwrap();
    assert_eq!(after.items[0].post.author.display_name, "The Author");

    svc.moderate_post(post.id, PostStatus::Hidden).await.unwrap();
    let hidden = svc.timeline(reader.id, &EndlessRequest::first()).await.unwrap();
    assert!(hidden.items.is_empty());
}

#[tokio::test]
async fn offset_pages_clamp_and_reject_out_of_range() {
    let svc = service_with(FeedConfig {
        offset_page_size: 2,
        offset_max_page_size: 3,
        ..config()
    });
    let people = users(&svc, &["star", "a", "b", "c", "d", "e"]).await;
    let star = &people[0];
    for fan in &people[1..] {
        svc.follow(fan.id, star.id).await.unwrap();
    }

    let page = svc.followers(None, star.id, Some(1), Some(100)).await.unwrap();
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.total_results, 5);
    assert!(page.has_next_page);

    let last = svc.followers(None, star.id, Some(3), None).await.unwrap();
    assert_eq!(last.items.len(), 1);
    assert!(!last.has_next_page);

    let err = svc.followers(None, star.id, Some(4), None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn failed_recipients_can_be_retried() {
    let svc = service_with(config());
    let people = users(&svc, &["author", "f1", "f2"]).await;
    let (author, f1, f2) = (&people[0], &people[1], &people[2]);
    svc.follow(f1.id, author.id).await.unwrap();
    svc.follow(f2.id, author.id).await.unwrap();

    // f1 reads first, so its timeline is warm and empty.
    assert!(svc
        .timeline(f1.id, &EndlessRequest::first())
        .await
        .unwrap()
        .items
        .is_empty());

    svc.store().fail_feed_writes_for(f1.id);
    let post = svc
        .publish(author.id, "partially delivered")
        .await
        .expect("publish succeeds despite fan-out failures");

    assert!(svc
        .timeline(f1.id, &EndlessRequest::first())
        .await
        .unwrap()
        .items
        .is_empty());
    assert_eq!(
        svc.timeline(f2.id, &EndlessRequest::first())
            .await
            .unwrap()
            .items
            .len(),
        1
    );

    svc.store().restore_feed_writes_for(f1.id);
    let report = svc.fanout_engine().retry(&post, &[f1.id]).await;
    assert_eq!(report.delivered, 1);

    let page = svc.timeline(f1.id, &EndlessRequest::first()).await.unwrap();
    assert_eq!(page.items[0].post.id, post.id);
}

#[tokio::test]
async fn background_fan_out_completes_after_publish_returns() {
    let svc = service_with(FeedConfig {
        fanout_mode: FanoutMode::Background,
        ..config()
    });
    let people = users(&svc, &["author", "f1", "f2", "f3"]).await;
    let author = &people[0];
    for follower in &people[1..] {
        svc.follow(follower.id, author.id).await.unwrap();
    }

    let post = svc.publish(author.id, "eventually everywhere").await.unwrap();
    let own = svc.timeline(author.id, &EndlessRequest::first()).await.unwrap();
    assert_eq!(own.items[0].post.id, post.id);

    let reports = svc.drain_fanout().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].delivered, 4, "three followers and the author");
    for follower in &people[1..] {
        let page = svc.timeline(follower.id, &EndlessRequest::first()).await.unwrap();
        assert_eq!(page.items[0].post.id, post.id);
    }
}

/// Cache store that is always down.
#[derive(Clone, Copy, Default)]
struct UnreachableBackend;

fn refused() -> Error {
    Error::BackendError("connection refused".into())
}

impl CacheBackend for UnreachableBackend {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(refused())
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        Err(refused())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(refused())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Err(refused())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(false)
    }

    async fn clear_all(&self) -> Result<()> {
        Err(refused())
    }

    async fn list_get(&self, _key: &str) -> Result<Option<Vec<Vec<u8>>>> {
        Err(refused())
    }

    async fn list_init(
        &self,
        _key: &str,
        _items: Vec<(i64, Vec<u8>)>,
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        Err(refused())
    }

    async fn list_push(
        &self,
        _key: &str,
        _score: i64,
        _item: Vec<u8>,
        _bound: usize,
    ) -> Result<ListPush> {
        Err(refused())
    }
}

#[tokio::test]
async fn everything_fails_open_when_the_cache_is_down() {
    init_logging();
    let svc = FeedService::new(Arc::new(InMemoryStore::new()), UnreachableBackend, config())
        .expect("Failed to build service");
    let people = users(&svc, &["author", "reader"]).await;
    let (author, reader) = (&people[0], &people[1]);

    svc.follow(reader.id, author.id).await.unwrap();
    let post = svc.publish(author.id, "cache is down").await.unwrap();
    svc.update_user(author.id, "Still Works").await.unwrap();

    let page = svc.timeline(reader.id, &EndlessRequest::first()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].post.id, post.id);
    assert_eq!(page.items[0].post.author.display_name, "Still Works");

    let followers = svc.followers(Some(reader.id), author.id, None, None).await.unwrap();
    assert_eq!(followers.items.len(), 1);
}
