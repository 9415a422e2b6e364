use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sharded_counter::{
    DocumentStore, ShardedCounterWorker, Slice, Transaction, Value, WorkerExit, WorkerMetadata,
    WorkerOptions,
};

mod support;

use support::{data, fields, put, put_worker, seed_two_counters, shared_store};

const METADOC: &str = "_firebase_ext_/sharded_counter/workers/0000";

fn single_run() -> WorkerOptions {
    WorkerOptions {
        run_budget: Duration::from_secs(10),
        round_interval: Duration::from_millis(5),
        ..WorkerOptions::default()
    }
    .with_single_run(true)
}

async fn load(store: &Arc<dyn DocumentStore>, options: WorkerOptions) -> anyhow::Result<ShardedCounterWorker> {
    ShardedCounterWorker::load(store.clone(), METADOC, options)
        .await?
        .ok_or_else(|| anyhow::anyhow!("worker metadata missing"))
}

#[tokio::test]
async fn worker_single_run_aggregates_counters() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    seed_two_counters(store.as_ref(), "test").await?;
    put_worker(store.as_ref(), METADOC, Slice::full()).await?;

    let report = load(&dyn_store, single_run()).await?.run().await?;
    assert_eq!(report.exit, WorkerExit::RangeDrained);
    assert_eq!(report.plans_failed, 0);
    assert_eq!(report.stats.shards_aggregated, 6);

    assert_eq!(
        data(store.as_ref(), "test/counter1").await?,
        Some(fields(json!({"stats": {"cnt": 10, "new": 5}, "data": "hello world"})))
    );
    assert_eq!(
        data(store.as_ref(), "test/counter2").await?,
        Some(fields(json!({"stats": {"cnt": 3}})))
    );
    // shards deleted, the drained partial cleaned up
    assert_eq!(
        store.paths(),
        vec![METADOC.to_string(), "test/counter1".to_string(), "test/counter2".to_string()]
    );

    let metadoc = store.get(METADOC).await?;
    let metadata = WorkerMetadata::from_fields(metadoc.data.as_ref().unwrap())?;
    let stats = metadata.stats.expect("stats written");
    assert_eq!(stats.shards_aggregated, 6);
    assert!(stats.rounds >= 2);
    Ok(())
}

#[tokio::test]
async fn worker_split_slices_meet_at_the_counter() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    let shards = "test/counter1/_counter_shards_";
    let total = 300;
    for _ in 0..total {
        put(store.as_ref(), &format!("{shards}/{}", uuid::Uuid::new_v4()), json!({"counter": 1})).await?;
    }
    let midpoint = format!("{shards}/80000000-0000-0000-0000-000000000000");

    // upper half: too deep in the keyspace to write the counter directly
    put_worker(store.as_ref(), METADOC, Slice::new(midpoint.clone(), "")).await?;
    let report = load(&dyn_store, single_run()).await?.run().await?;
    assert_eq!(report.exit, WorkerExit::RangeDrained);
    assert!(!store.get("test/counter1").await?.exists());
    let partials = store
        .paths()
        .into_iter()
        .filter(|path| path.starts_with(&format!("{shards}/\t")))
        .count();
    assert!(partials > 0);

    // lower half picks up the partials too
    put_worker(store.as_ref(), METADOC, Slice::new("", midpoint)).await?;
    let report = load(&dyn_store, single_run()).await?.run().await?;
    assert_eq!(report.exit, WorkerExit::RangeDrained);

    assert_eq!(
        data(store.as_ref(), "test/counter1").await?,
        Some(fields(json!({"counter": total})))
    );
    assert!(store.paths().iter().all(|path| !path.starts_with(shards)));
    Ok(())
}

#[tokio::test]
async fn worker_skips_failed_plans() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    seed_two_counters(store.as_ref(), "test").await?;
    put_worker(store.as_ref(), METADOC, Slice::full()).await?;
    store.fail_commits_under("test/counter1");

    let options = WorkerOptions {
        run_budget: Duration::from_millis(200),
        ..single_run()
    };
    let report = load(&dyn_store, options).await?.run().await?;
    assert_eq!(report.exit, WorkerExit::BudgetExhausted);
    assert!(report.plans_failed >= 1);

    // the healthy counter went through, the failing one kept its shards
    assert_eq!(
        data(store.as_ref(), "test/counter2").await?,
        Some(fields(json!({"stats": {"cnt": 3}})))
    );
    assert!(store.get("test/counter1/_counter_shards_/012345678").await?.exists());
    assert_eq!(
        store.get("test/counter1").await?.get("stats.cnt"),
        Some(&Value::Integer(2))
    );

    store.clear_failures();
    let report = load(&dyn_store, single_run()).await?.run().await?;
    assert_eq!(report.exit, WorkerExit::RangeDrained);
    assert_eq!(
        data(store.as_ref(), "test/counter1").await?,
        Some(fields(json!({"stats": {"cnt": 10, "new": 5}, "data": "hello world"})))
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_stops_when_metadata_changes() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    put_worker(store.as_ref(), METADOC, Slice::full()).await?;

    let options = WorkerOptions {
        run_budget: Duration::from_secs(10),
        round_interval: Duration::from_millis(10),
        ..WorkerOptions::default()
    };
    let worker = load(&dyn_store, options).await?;
    let started = Instant::now();
    let run = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    // a reshard replaces the assignment
    put_worker(store.as_ref(), METADOC, Slice::new("", "m")).await?;

    let report = run.await??;
    assert_eq!(report.exit, WorkerExit::Revoked);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(store.get(METADOC).await?.get("stats").is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_stops_when_metadata_is_deleted() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    put_worker(store.as_ref(), METADOC, Slice::full()).await?;

    let options = WorkerOptions {
        run_budget: Duration::from_secs(10),
        round_interval: Duration::from_millis(10),
        ..WorkerOptions::default()
    };
    let worker = load(&dyn_store, options).await?;
    let started = Instant::now();
    let run = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    // scale-down removes the worker document
    let mut txn = Transaction::new(store.as_ref());
    txn.delete(METADOC);
    txn.commit().await?;

    let report = run.await??;
    assert_eq!(report.exit, WorkerExit::Revoked);
    assert!(started.elapsed() < Duration::from_secs(5));
    // the stats write must not bring the document back
    assert!(!store.get(METADOC).await?.exists());
    assert!(store.paths().is_empty());
    Ok(())
}

#[tokio::test]
async fn worker_compacts_long_partials() -> anyhow::Result<()> {
    support::init_tracing();
    let (store, dyn_store) = shared_store();
    let partial = "test/counter1/_counter_shards_/\t\t\t\t0";
    let entries: Vec<_> = (0..12)
        .map(|i| json!({"_id_": format!("e{i}"), "_data_": {"n": 1}}))
        .collect();
    put(store.as_ref(), partial, json!({"_updates_": entries})).await?;
    put_worker(store.as_ref(), METADOC, Slice::full()).await?;

    let report = load(&dyn_store, single_run()).await?.run().await?;
    assert_eq!(report.exit, WorkerExit::RangeDrained);
    assert_eq!(store.get("test/counter1").await?.get("n"), Some(&Value::Integer(12)));
    assert!(!store.get(partial).await?.exists());
    Ok(())
}
