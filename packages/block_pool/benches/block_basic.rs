//! Basic benchmarks for the `block_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use block_pool::{AllocatorExt, BlockPool, PoolConfig, SharedPool, TypeTag};
use criterion::{Criterion, criterion_group, criterion_main};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = u64;
const TEST_VALUE: TestItem = 1024;
const CONFIG: PoolConfig = PoolConfig::for_type::<TestItem>(64);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_basic");

    group.bench_function("build", |b| {
        b.iter(|| drop(black_box(BlockPool::from_config(CONFIG).unwrap())));
    });

    group.bench_function("allocate_one", |b| {
        b.iter_custom(|iters| {
            let mut pools = iter::repeat_with(|| BlockPool::from_config(CONFIG).unwrap())
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for pool in &mut pools {
                _ = black_box(pool.allocate(black_box(8), TypeTag::UNTYPED).unwrap());
            }

            start.elapsed()
        });
    });

    group.bench_function("allocate_release", |b| {
        let mut pool = BlockPool::from_config(CONFIG).unwrap();

        b.iter(|| {
            let handle = pool.allocate(black_box(8), TypeTag::UNTYPED).unwrap();
            black_box(pool.release(handle).unwrap());
        });
    });

    group.bench_function("add_reference_release", |b| {
        let mut pool = BlockPool::from_config(CONFIG).unwrap();
        let handle = pool.allocate(8, TypeTag::UNTYPED).unwrap();

        b.iter(|| {
            let extra = pool.add_reference(black_box(&handle)).unwrap();
            black_box(pool.release(extra).unwrap());
        });
    });

    group.bench_function("read_value", |b| {
        let mut pool = BlockPool::from_config(CONFIG).unwrap();
        let handle = pool.allocate(8, TypeTag::UNTYPED).unwrap();
        pool.write_value(&handle, &TEST_VALUE).unwrap();

        b.iter(|| black_box(pool.read_value::<TestItem>(black_box(&handle)).unwrap()));
    });

    group.bench_function("shared_clone_drop", |b| {
        let pool = SharedPool::new(BlockPool::from_config(CONFIG).unwrap());
        let shared = pool.allocate_value(&TEST_VALUE, TypeTag::UNTYPED).unwrap();

        b.iter(|| drop(black_box(shared.clone())));
    });

    group.finish();
}
