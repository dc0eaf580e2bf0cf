//! Handle lookup benchmark
//!
//! Cached handles should cost a map probe, not a collection open.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pos_common::{RouterConfig, ShardId, TenantPrefix};
use pos_store::MemoryDriver;
use pos_tenancy::{DirectoryCache, EntityKind, InMemoryStoreRegistry, PosTenancy, TenantRecord};
use std::sync::Arc;
use std::time::Duration;

fn stack(tenants: u16) -> PosTenancy {
    let records = (0..tenants)
        .map(|i| {
            let prefix = format!("store_{}", i);
            TenantRecord::new(
                format!("st-{}", i),
                TenantPrefix::parse(&prefix).unwrap(),
                ShardId::from_raw(i % 5 + 1),
            )
        })
        .collect();
    let config = RouterConfig::with_base_uri("mongodb://localhost:27017");
    PosTenancy::new(
        config,
        Arc::new(MemoryDriver::new()),
        Arc::new(InMemoryStoreRegistry::with_records(records)),
    )
    .unwrap()
}

fn handle_lookup_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let tenancy = stack(10);
    rt.block_on(tenancy.models.get_handle("store_1", ShardId::from_raw(2), EntityKind::Product))
        .unwrap();

    let mut group = c.benchmark_group("handle_lookup");

    group.bench_function("cached", |b| {
        b.iter(|| {
            rt.block_on(tenancy.models.get_handle(
                black_box("store_1"),
                ShardId::from_raw(2),
                EntityKind::Product,
            ))
            .unwrap()
        })
    });

    group.bench_function("resolve_and_lookup", |b| {
        b.iter(|| {
            rt.block_on(tenancy.models.get_handle_for_tenant(black_box("st-1"), EntityKind::Product))
                .unwrap()
        })
    });

    group.finish();
}

fn directory_cache_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("directory_cache");

    for size in [100u64, 10_000, 100_000].iter() {
        let cache = DirectoryCache::new(Duration::from_secs(3600), *size);
        for i in 0..*size {
            cache.put(&format!("user{}@x.com", i), Some("acme"));
        }
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| cache.get(black_box(&format!("user{}@x.com", size / 2))))
        });
    }

    group.finish();
}

criterion_group!(benches, handle_lookup_benchmark, directory_cache_benchmark);
criterion_main!(benches);
