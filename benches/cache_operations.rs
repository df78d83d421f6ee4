use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pantry_cache::{
    CacheConfig, CacheKey, DedupKey, DurableConfig, Record, RecordSet, Selection, TieredCache,
};
use pantry_cache::projection::project_root;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

fn items(count: usize, revision: usize) -> RecordSet {
    let mut set = RecordSet::new();
    for i in 0..count {
        set.insert(
            CacheKey::new("Item", i.to_string()),
            Record::new()
                .with("name", json!(format!("item{}", i)))
                .with("quantity", json!(i + revision))
                .with("household", CacheKey::new("Household", "h1")),
        );
    }
    set
}

fn keys(count: usize) -> HashSet<CacheKey> {
    (0..count)
        .map(|i| CacheKey::new("Item", i.to_string()))
        .collect()
}

/// Benchmark: merge into the volatile tier
fn bench_merge_volatile(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_volatile");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let cache = TieredCache::open(CacheConfig::in_memory());
            let mut revision = 0;
            b.iter(|| {
                revision += 1;
                black_box(cache.merge(&items(size, revision)))
            });
        });
    }

    group.finish();
}

/// Benchmark: merging an unchanged set (diff only, no writes)
fn bench_merge_unchanged(c: &mut Criterion) {
    let cache = TieredCache::open(CacheConfig::in_memory());
    let set = items(100, 0);
    cache.merge(&set);

    c.bench_function("merge_unchanged_100", |b| {
        b.iter(|| black_box(cache.merge(&set)))
    });
}

/// Benchmark: merge through the durable tier
fn bench_merge_durable(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let cache = TieredCache::open(CacheConfig::with_durable(DurableConfig::new(dir.path())));
    let mut revision = 0;

    c.bench_function("merge_durable_10", |b| {
        b.iter(|| {
            revision += 1;
            black_box(cache.merge(&items(10, revision)))
        })
    });
}

/// Benchmark: load hits in each tier
fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");
    let wanted = keys(100);

    let cache = TieredCache::open(CacheConfig::in_memory());
    cache.merge(&items(100, 0));
    group.bench_function("volatile_hit_100", |b| b.iter(|| black_box(cache.load(&wanted))));

    let dir = TempDir::new().unwrap();
    let durable = TieredCache::open(CacheConfig::with_durable(DurableConfig::new(dir.path())));
    durable.merge(&items(100, 0));
    group.bench_function("durable_hit_100", |b| {
        b.iter(|| {
            durable.evict_volatile();
            black_box(durable.load(&wanted))
        })
    });

    group.finish();
}

/// Benchmark: projecting a list query with dependency capture
fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection");

    for size in [10, 100, 1000] {
        let cache = TieredCache::open(CacheConfig::in_memory());
        let root = DedupKey::new("items", &json!({"household": "h1"})).root_key();
        let mut set = items(size, 0);
        let list: Vec<CacheKey> = keys(size).into_iter().collect();
        set.insert(root.clone(), Record::new().with("result", list));
        cache.merge(&set);
        let selection = Selection::fields(["name", "quantity"]);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(project_root(&cache, &root, &selection)))
        });
    }

    group.finish();
}

fn configure_criterion() -> Criterion {
    Criterion::default()
        .measurement_time(Duration::from_secs(3))
        .sample_size(50)
}

criterion_group! {
    name = benches;
    config = configure_criterion();
    targets =
        bench_merge_volatile,
        bench_merge_unchanged,
        bench_merge_durable,
        bench_load,
        bench_projection
}
criterion_main!(benches);
