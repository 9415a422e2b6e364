//! Quick benchmarks for CI and development feedback (~30 seconds).
//!
//! Run with:
//! ```
//! cargo bench --bench bench_quick
//! ```
//!
//! Covers the pure planning and aggregation paths plus one full worker drain
//! against the in-memory store.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use sharded_counter::test_support::{generate_shards, seed_store};
use sharded_counter::{
    aggregate, plan_aggregations, DocumentStore, MemoryStore, ShardedCounterWorker, Slice,
    Snapshot, Transaction, WorkerMetadata, WorkerOptions,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

// =============================================================================
// PLANNER BENCHMARKS
// =============================================================================

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("quick/plan");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    for &(counters, shards) in &[(1usize, 500usize), (50, 10)] {
        let dataset = generate_shards(counters, shards, 42);
        let page = dataset.snapshots;
        let start = page.first().map(|s| s.path.clone()).unwrap_or_default();

        group.throughput(Throughput::Elements(page.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("counter_level", format!("{counters}x{shards}")),
            &page,
            |b, page| b.iter(|| black_box(plan_aggregations("", page).len())),
        );
        group.bench_with_input(
            BenchmarkId::new("prefix_level", format!("{counters}x{shards}")),
            &(start, page.clone()),
            |b, (start, page)| b.iter(|| black_box(plan_aggregations(start, page).len())),
        );
    }

    group.finish();
}

// =============================================================================
// AGGREGATOR BENCHMARKS
// =============================================================================

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("quick/aggregate");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(3));

    let shards = generate_shards(1, 1_000, 7).snapshots;
    let counter = Snapshot::missing("counters/c0000");

    group.throughput(Throughput::Elements(shards.len() as u64));
    group.bench_function("to_counter", |b| {
        b.iter(|| black_box(aggregate(Some(&counter), &[], &shards)))
    });
    group.bench_function("to_partial", |b| {
        b.iter(|| black_box(aggregate(None, &[], &shards)))
    });

    group.finish();
}

// =============================================================================
// WORKER BENCHMARKS
// =============================================================================

fn bench_worker_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("quick/worker");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(1));
    group.measurement_time(Duration::from_secs(5));

    let rt = Runtime::new().expect("runtime");
    let dataset = generate_shards(20, 50, 11);
    let metadoc = "_firebase_ext_/sharded_counter/workers/0000";
    let options = WorkerOptions {
        round_interval: Duration::from_millis(1),
        ..WorkerOptions::default()
    }
    .with_single_run(true);

    group.throughput(Throughput::Elements(dataset.snapshots.len() as u64));
    group.bench_function("single_run_drain", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
                    seed_store(store.as_ref(), &dataset).await.expect("seed");
                    let mut txn = Transaction::new(store.as_ref());
                    let metadata = WorkerMetadata::new(Slice::full(), 1);
                    txn.set(metadoc, metadata.to_fields().expect("metadata"));
                    txn.commit().await.expect("metadata commit");
                    store
                })
            },
            |store| {
                rt.block_on(async {
                    let worker = ShardedCounterWorker::load(store, metadoc, options.clone())
                        .await
                        .expect("load")
                        .expect("worker");
                    black_box(worker.run().await.expect("run"))
                })
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(quick_benches, bench_plan, bench_aggregate, bench_worker_drain);
criterion_main!(quick_benches);
