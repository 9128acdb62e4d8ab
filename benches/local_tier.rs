//! Benchmark for the local cache tier
//!
//! Target: sub-microsecond get/set on a warm tier

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use market_cache::cache::{KeyPattern, LocalTier};
use market_cache::LocalTierConfig;
use serde_json::json;
use std::sync::Arc;

fn tier(max_entries: usize) -> LocalTier {
    LocalTier::new(LocalTierConfig {
        max_entries,
        ..Default::default()
    })
}

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_tier");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_new_key", |b| {
        let tier = tier(1_000_000);
        let value = json!({"sell": 9500, "buy": 9100});
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let key = format!("market:commodity:c{}", counter);
            tier.set(black_box(&key), value.clone(), None);
        });
    });

    group.bench_function("set_with_eviction", |b| {
        let tier = tier(1_000);
        let value = json!(1);
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let key = format!("market:commodity:c{}", counter);
            tier.set(black_box(&key), value.clone(), None);
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_tier");
    group.throughput(Throughput::Elements(1));

    let tier = tier(10_000);
    for i in 0..10_000 {
        tier.set(&format!("market:commodity:c{:05}", i), json!(i), None);
    }

    group.bench_function("get_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("market:commodity:c{:05}", counter % 10_000);
            black_box(tier.get(&key));
        });
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| {
            black_box(tier.get(black_box("market:commodity:absent")));
        });
    });

    group.finish();
}

fn bench_delete_by_pattern(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_tier");
    group.throughput(Throughput::Elements(10_000));

    let pattern = KeyPattern::new("market:commodity:gold*").unwrap_or_else(|_| KeyPattern::all());

    group.bench_function("delete_by_pattern_10k", |b| {
        let tier = tier(10_000);
        b.iter(|| {
            for i in 0..100 {
                tier.set(&format!("market:commodity:gold:s{}", i), json!(i), None);
            }
            black_box(tier.delete_by_pattern(&pattern));
        });
    });

    group.finish();
}

fn bench_concurrent_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_tier");
    group.throughput(Throughput::Elements(100));

    let tier = Arc::new(tier(10_000));
    for i in 0..1_000 {
        tier.set(&format!("k{:04}", i), json!(i), None);
    }

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_gets", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let tier = Arc::clone(&tier);
                    handles.push(tokio::spawn(async move {
                        tier.get(&format!("k{:04}", i * 7 % 1_000))
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_delete_by_pattern,
    bench_concurrent_access
);
criterion_main!(benches);
