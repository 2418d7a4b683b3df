//! Chunk space benchmarks for chronostore
//!
//! Measures cache hits, insert-with-eviction churn, and dirty declaration
//! followed by a drain.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use chronostore::chunk::{ChunkKind, Coord};
use chronostore::{ChunkSpace, MemoryDriver};

fn at(obj: i64) -> Coord {
    Coord::new(0, 0, obj)
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_space_get");
    let space = ChunkSpace::new(10_000).unwrap();
    for obj in 0..10_000 {
        space.create(at(obj), ChunkKind::LongTree).unwrap();
    }

    group.bench_function("hit", |b| {
        let mut obj = 0;
        b.iter(|| {
            obj = (obj + 7_919) % 10_000;
            black_box(space.get(at(obj)))
        });
    });
    group.bench_function("miss", |b| {
        let mut obj = 10_000;
        b.iter(|| {
            obj += 1;
            black_box(space.get(at(obj)))
        });
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_space_churn");

    for capacity in [64usize, 4_096].iter() {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(
            BenchmarkId::new("clean_eviction", capacity),
            capacity,
            |b, &capacity| {
                b.iter_with_setup(
                    || ChunkSpace::new(capacity).unwrap(),
                    |space| {
                        for obj in 0..10_000 {
                            space.create(at(obj), ChunkKind::LongTree).unwrap();
                        }
                        space
                    },
                );
            },
        );

        group.bench_with_input(
            BenchmarkId::new("dirty_write_back", capacity),
            capacity,
            |b, &capacity| {
                b.iter_with_setup(
                    || {
                        let space = ChunkSpace::new(capacity).unwrap();
                        space.set_driver(Arc::new(MemoryDriver::new()));
                        space
                    },
                    |space| {
                        for obj in 0..10_000 {
                            let chunk = space.create(at(obj), ChunkKind::LongLongMap).unwrap();
                            chunk.as_long_map().unwrap().put(obj, obj);
                        }
                        space
                    },
                );
            },
        );
    }

    group.finish();
}

fn bench_dirty_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_space_dirty");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("declare_and_drain_1000", |b| {
        let space = ChunkSpace::new(1_000).unwrap();
        b.iter(|| {
            for obj in 0..1_000 {
                space.declare_dirty(at(obj));
            }
            black_box(space.detach_dirties().len())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_get, bench_churn, bench_dirty_drain);
criterion_main!(benches);
