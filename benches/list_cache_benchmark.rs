use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use feed_kit::backend::InMemoryBackend;
use feed_kit::{FeedConfig, FeedEntry, ListCache, ListKey};
use std::hint::black_box;

fn entry(i: u64) -> FeedEntry {
    FeedEntry {
        id: i,
        recipient_id: 1,
        post_id: i,
        created_at: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
    }
}

fn entries(count: u64) -> Vec<FeedEntry> {
    (1..=count).map(entry).collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Reading a warm timeline of N items.
fn bench_warm_load(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("list_cache_load");

    for size in [100u64, 500, 1000] {
        let lists = ListCache::new(InMemoryBackend::new(), &FeedConfig::default());
        let key = ListKey::timeline(1);
        let seed = entries(size);
        rt.block_on(async {
            lists
                .load(&key, |_| {
                    let rows = seed.clone();
                    async move { Ok(rows) }
                })
                .await
                .unwrap();
        });

        group.bench_with_input(BenchmarkId::new("warm", size), &size, |b, _| {
            b.to_async(&rt).iter(|| {
                let lists = &lists;
                let key = &key;
                async move {
                    let loaded: Vec<FeedEntry> = lists
                        .load(key, |_| async { Ok(Vec::new()) })
                        .await
                        .unwrap();
                    black_box(loaded)
                }
            });
        });
    }

    group.finish();
}

/// Pushing new items into a list that is already at its bound.
fn bench_push_at_bound(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("list_cache_push");

    for bound in [100usize, 1000] {
        let config = FeedConfig {
            list_bound: bound,
            ..FeedConfig::default()
        };
        let lists = ListCache::new(InMemoryBackend::new(), &config);
        let key = ListKey::timeline(1);
        let seed = entries(bound as u64);
        rt.block_on(async {
            lists
                .load(&key, |_| {
                    let rows = seed.clone();
                    async move { Ok(rows) }
                })
                .await
                .unwrap();
        });

        let mut next = bound as u64;
        group.bench_with_input(BenchmarkId::new("bounded", bound), &bound, |b, _| {
            b.to_async(&rt).iter(|| {
                next += 1;
                let item = entry(next);
                let lists = &lists;
                let key = &key;
                async move { black_box(lists.push(key, &item).await.unwrap()) }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_warm_load, bench_push_at_bound);
criterion_main!(benches);
