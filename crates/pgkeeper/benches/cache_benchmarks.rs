//! Benchmarks for fingerprinting and the cache hit path
//!
//! Run with `--features test-utils`; handles are built over the scripted
//! driver so no database is needed.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pgkeeper::testing::MockDriver;
use pgkeeper::{ConnectionConfig, ConnectionManager, ConnectionType, Fingerprint, PoolSettings};
use tokio::runtime::Runtime;

fn create_test_config(extra_settings: usize) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(ConnectionType::Normal)
        .with_setting("host", "bench.internal")
        .with_setting("port", 5432_i64)
        .with_setting("user", "bench")
        .with_setting("password", "secret")
        .with_setting("dbname", "bench")
        .with_pool_settings(PoolSettings::default().with_size(2, 4));
    for i in 0..extra_settings {
        config = config.with_session_setting(format!("app.setting_{i}"), format!("value_{i}"));
    }
    config
}

fn create_manager() -> Arc<ConnectionManager> {
    let driver = MockDriver::new();
    Arc::new(ConnectionManager::with_drivers(
        Arc::new(driver.clone()),
        Arc::new(driver),
    ))
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    for size in [0, 16, 128] {
        let config = create_test_config(size);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("of", size), &config, |b, config| {
            b.iter(|| black_box(Fingerprint::of(config, ConnectionType::Pool)));
        });
    }

    group.finish();
}

fn bench_cache_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_hit");
    let config = create_test_config(8);

    for ty in [ConnectionType::Normal, ConnectionType::Pool] {
        let manager = create_manager();
        manager.acquire(&config, Some(ty)).unwrap();

        group.bench_function(BenchmarkId::new("acquire", ty), |b| {
            b.iter(|| black_box(manager.acquire(&config, Some(ty)).unwrap()));
        });
        manager.clear();
    }

    let rt = Runtime::new().unwrap();
    for ty in [ConnectionType::Async, ConnectionType::AsyncPool] {
        let manager = create_manager();
        rt.block_on(manager.acquire_async(&config, Some(ty))).unwrap();

        group.bench_function(BenchmarkId::new("acquire_async", ty), |b| {
            b.to_async(&rt)
                .iter(|| async { black_box(manager.acquire_async(&config, Some(ty)).await.unwrap()) });
        });
        rt.block_on(manager.clear_async());
    }

    group.finish();
}

fn bench_concurrent_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_hits");
    let config = create_test_config(8);
    let manager = create_manager();
    manager.acquire(&config, None).unwrap();

    for threads in [2, 8] {
        group.throughput(Throughput::Elements(threads as u64 * 100));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                std::thread::scope(|s| {
                    for _ in 0..threads {
                        s.spawn(|| {
                            for _ in 0..100 {
                                black_box(manager.acquire(&config, None).unwrap());
                            }
                        });
                    }
                });
            });
        });
    }

    manager.clear();
    group.finish();
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_cache_hit,
    bench_concurrent_hits
);
criterion_main!(benches);
