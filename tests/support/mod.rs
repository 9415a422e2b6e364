use std::sync::{Arc, Once};
use std::time::Duration;

use serde_json::json;
use sharded_counter::{
    CounterConfig, DocumentStore, Fields, MemoryStore, Slice, Transaction, Value, WorkerMetadata,
};

static TRACING: Once = Once::new();

#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[allow(dead_code)]
pub fn fields(value: serde_json::Value) -> Fields {
    serde_json::from_value(value).expect("document fields")
}

#[allow(dead_code)]
pub async fn put(store: &dyn DocumentStore, path: &str, value: serde_json::Value) -> anyhow::Result<()> {
    let mut txn = Transaction::new(store);
    txn.set(path, fields(value));
    txn.commit().await?;
    Ok(())
}

#[allow(dead_code)]
pub async fn put_worker(store: &dyn DocumentStore, path: &str, slice: Slice) -> anyhow::Result<()> {
    let metadata = WorkerMetadata::new(slice, 1);
    let mut txn = Transaction::new(store);
    txn.set(path, metadata.to_fields()?);
    txn.commit().await?;
    Ok(())
}

#[allow(dead_code)]
pub async fn data(store: &dyn DocumentStore, path: &str) -> anyhow::Result<Option<Fields>> {
    Ok(store.get(path).await?.data)
}

#[allow(dead_code)]
pub async fn field(store: &dyn DocumentStore, path: &str, field: &str) -> anyhow::Result<Option<Value>> {
    Ok(store.get(path).await?.get(field).cloned())
}

/// The two-counter fixture: `counter1` with an existing value, a partial
/// and four shards, `counter2` with two shards and no document.
#[allow(dead_code)]
pub async fn seed_two_counters(store: &dyn DocumentStore, root: &str) -> anyhow::Result<()> {
    let counter1 = format!("{root}/counter1");
    let counter2 = format!("{root}/counter2");
    put(store, &counter1, json!({"stats": {"cnt": 2}, "data": "hello world"})).await?;
    put(
        store,
        &format!("{counter1}/_counter_shards_/\t\t012"),
        json!({"_updates_": [{"_id_": "seed", "_data_": {"stats": {"cnt": 2}}}]}),
    )
    .await?;
    put(store, &format!("{counter1}/_counter_shards_/012345678"), json!({"stats": {"cnt": 1}})).await?;
    put(store, &format!("{counter1}/_counter_shards_/123456789"), json!({"stats": {"cnt": 2}})).await?;
    put(store, &format!("{counter1}/_counter_shards_/23456789a"), json!({"stats": {"cnt": 3}})).await?;
    put(store, &format!("{counter1}/_counter_shards_/3456789ab"), json!({"stats": {"new": 5}})).await?;
    put(store, &format!("{counter2}/_counter_shards_/012345678"), json!({"stats": {"cnt": 1}})).await?;
    put(store, &format!("{counter2}/_counter_shards_/123456789"), json!({"stats": {"cnt": 2}})).await?;
    Ok(())
}

/// Config with budgets short enough for tests.
#[allow(dead_code)]
pub fn fast_config() -> CounterConfig {
    let mut config = CounterConfig::default();
    config.worker.run_budget_ms = 300;
    config.worker.round_interval_ms = 10;
    config.controller.interval_ms = 50;
    config.controller.stale_after_secs = 90;
    config
}

#[allow(dead_code)]
pub fn shared_store() -> (Arc<MemoryStore>, Arc<dyn DocumentStore>) {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn DocumentStore> = store.clone();
    (store, dyn_store)
}

/// Poll `check` until it returns true or `timeout` passes.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<bool>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
