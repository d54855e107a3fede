//! Pool benchmarks: take/return cycles per second
//!
//! Measures the two paths that matter for the staging layer:
//! - The promoted same-thread take/return cycle (lock-free steady state)
//! - The tiered manager's take/return across the size-class ladder

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stagecoach::alloc::HeapAlloc;
use stagecoach::manager::BufferManager;
use stagecoach::pool::SyncPool;

const REQUEST_SIZES: &[usize] = &[64, 512, 2048, 16384];

/// Same-thread take/return cycle after promotion.
fn sync_pool_steady_state(c: &mut Criterion) {
    stagecoach::dev_tracing::init_tracing();

    let pool = SyncPool::new(64);
    // Drive enough cycles through the global pool to earn a dedicated slot.
    for i in 0..128u64 {
        pool.return_value(i);
        pool.take();
    }

    c.bench_function("pool/steady_state_cycle", |b| {
        b.iter(|| {
            pool.return_value(black_box(7u64));
            black_box(pool.take());
        });
    });
}

/// Manager take/return across ladder sizes, single-threaded reuse path.
fn manager_take_return(c: &mut Criterion) {
    let manager = BufferManager::new(1 << 22, 65536, Arc::new(HeapAlloc)).unwrap();
    let mut group = c.benchmark_group("manager/take_return");

    for &size in REQUEST_SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let buf = manager.take_buffer(black_box(size)).unwrap();
                manager.return_buffer(buf).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, sync_pool_steady_state, manager_take_return);
criterion_main!(benches);
