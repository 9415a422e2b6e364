//! Client side of a sharded counter.
//!
//! Each client instance writes to its own shard, so concurrent clients
//! never contend on one document. Reads add up the counter field, the
//! client's shard and the partials that shard rolls up through, so a
//! client sees its own increments before aggregation catches up.

use crate::aggregator::partial_sum;
use crate::config::{CounterConfig, DEFAULT_SHARDS_COLLECTION_ID};
use crate::sharding::{join, partial_ancestors};
use crate::store::{DocumentStore, Transaction};
use crate::value::{get_field, Number, Value};
use anyhow::{ensure, Result};
use std::sync::Arc;

pub struct ShardedCounter {
    store: Arc<dyn DocumentStore>,
    counter_path: String,
    field: String,
    shards_collection: String,
    shard_id: String,
}

impl ShardedCounter {
    /// Counter at `field` (a dotted path) of the document `counter_path`,
    /// with a fresh random shard.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        counter_path: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        let counter_path = counter_path.into();
        let shards_collection = join(&counter_path, DEFAULT_SHARDS_COLLECTION_ID);
        Self {
            store,
            counter_path,
            field: field.into(),
            shards_collection,
            shard_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Counter whose shards land in the collection the deployment's workers
    /// and controller read.
    pub fn from_config(
        store: Arc<dyn DocumentStore>,
        config: &CounterConfig,
        counter_path: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::new(store, counter_path, field).with_collection_id(&config.shards.collection_id)
    }

    /// Reuse a persisted shard id.
    pub fn with_shard_id(mut self, shard_id: impl Into<String>) -> Self {
        self.shard_id = shard_id.into();
        self
    }

    pub fn with_collection_id(mut self, collection_id: &str) -> Self {
        self.shards_collection = join(&self.counter_path, collection_id);
        self
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// The client's shard document, for batching several counter fields
    /// into one write.
    pub fn shard_path(&self) -> String {
        join(&self.shards_collection, &self.shard_id)
    }

    pub async fn increment_by(&self, delta: impl Into<Number>) -> Result<()> {
        ensure!(!self.field.is_empty(), "counter field must not be empty");
        let mut txn = Transaction::new(self.store.as_ref());
        txn.increment(self.shard_path(), self.field.clone(), delta.into());
        txn.commit().await?;
        Ok(())
    }

    /// Latency-compensated value.
    pub async fn get(&self) -> Result<Number> {
        let mut paths = vec![self.counter_path.clone(), self.shard_path()];
        paths.extend(
            partial_ancestors(&self.shard_id)
                .iter()
                .map(|key| join(&self.shards_collection, key)),
        );
        let snapshots = self.store.get_all(&paths).await?;

        let mut total = Number::Integer(0);
        for (idx, snapshot) in snapshots.iter().enumerate() {
            let Some(data) = snapshot.data.as_ref() else {
                continue;
            };
            let value = if idx < 2 {
                get_field(data, &self.field).and_then(Value::as_number)
            } else {
                partial_sum(data).get(&self.field)
            };
            if let Some(value) = value {
                total = total + value;
            }
        }
        Ok(total)
    }
}
