//! Benchmarks for lease decisions on the in-memory storage

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lease_lock_core::prelude::*;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(10);

fn bench_memory_try_lock(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let storage = MemoryLockStorage::new();
    runtime.block_on(async {
        storage.create_lock("bench-lock").await.unwrap();
        storage.try_lock("bench-lock", "holder", TTL).await.unwrap();
    });

    let mut group = c.benchmark_group("memory_storage");
    group.bench_function("try_lock_extend", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(storage.try_lock("bench-lock", "holder", TTL).await.unwrap());
        });
    });

    group.bench_function("try_lock_contended", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(storage.try_lock("bench-lock", "contender", TTL).await.unwrap());
        });
    });

    group.bench_function("execute_under_lock", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(
                storage
                    .execute_under_lock("bench-lock", "holder", |()| async { Ok(1u64) })
                    .await
                    .unwrap(),
            );
        });
    });

    group.finish();
}

criterion_group!(benches, bench_memory_try_lock);
criterion_main!(benches);
