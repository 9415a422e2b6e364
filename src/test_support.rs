use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::DEFAULT_SHARDS_COLLECTION_ID;
use crate::sharding::join;
use crate::store::{DocumentStore, Snapshot, StoreError, Transaction};
use crate::value::{Fields, Value};

const HEX: &[u8] = b"0123456789abcdef";

#[derive(Debug, Clone)]
pub struct GeneratedShards {
    /// Shard snapshots ordered by path.
    pub snapshots: Vec<Snapshot>,
    /// Expected `count` total per counter path.
    pub totals: BTreeMap<String, i64>,
}

/// Random hex shard id.
pub fn random_shard_id(rng: &mut StdRng, len: usize) -> String {
    (0..len)
        .map(|_| HEX[rng.random_range(0..HEX.len())] as char)
        .collect()
}

/// Shards with a `count` increment and, for some, a nested `stats.hits`.
pub fn generate_shards(counters: usize, shards_per_counter: usize, seed: u64) -> GeneratedShards {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut snapshots = Vec::with_capacity(counters * shards_per_counter);
    let mut totals = BTreeMap::new();
    let mut seen = BTreeSet::new();

    for c in 0..counters {
        let counter = format!("counters/c{:04}", c);
        let collection = join(&counter, DEFAULT_SHARDS_COLLECTION_ID);
        let mut total = 0;
        for _ in 0..shards_per_counter {
            let count = rng.random_range(1..10);
            total += count;

            let mut fields = Fields::new();
            fields.insert("count".to_string(), Value::Integer(count));
            if rng.random_bool(0.3) {
                let mut stats = Fields::new();
                stats.insert("hits".to_string(), Value::Integer(rng.random_range(1..5)));
                fields.insert("stats".to_string(), Value::Map(stats));
            }
            let path = loop {
                let path = join(&collection, &random_shard_id(&mut rng, 8));
                if seen.insert(path.clone()) {
                    break path;
                }
            };
            snapshots.push(Snapshot {
                path,
                data: Some(fields),
                version: 1,
                update_time: None,
            });
        }
        totals.insert(counter, total);
    }

    snapshots.sort_by(|a, b| a.path.cmp(&b.path));
    GeneratedShards { snapshots, totals }
}

/// Write generated shards into a store.
pub async fn seed_store(store: &dyn DocumentStore, shards: &GeneratedShards) -> Result<(), StoreError> {
    let mut txn = Transaction::new(store);
    for snapshot in &shards.snapshots {
        if let Some(data) = snapshot.data.clone() {
            txn.set(snapshot.path.clone(), data);
        }
    }
    txn.commit().await
}
