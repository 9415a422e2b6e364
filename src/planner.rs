//! Aggregation planning.
//!
//! A worker owning a slice that starts deep inside one counter's shard
//! collection must not fold every shard straight into the counter: many
//! workers would then contend on that one document. Instead the planner
//! picks a prefix depth from the slice start and the last key on the page,
//! and groups documents into partials at that depth. Partials in turn flow
//! one level up on every pass until they reach the counter.

use crate::sharding::{
    basename, counter_path, decode_shard_key, dirname, encode_partial_key, is_partial_path,
    join, key_prefix, MAX_PREFIX_LEN,
};
use crate::store::Snapshot;
use std::collections::BTreeMap;

/// Documents to fold into one target.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPlan<'a> {
    /// Path of the counter or partial receiving the aggregate.
    pub aggregate: String,
    pub is_partial: bool,
    pub shards: Vec<&'a Snapshot>,
    pub partials: Vec<&'a Snapshot>,
}

/// Group `snapshots` (ordered by path) into aggregation plans, ordered by
/// target path. `start` is the owning slice's start key.
pub fn plan_aggregations<'a>(start: &str, snapshots: &'a [Snapshot]) -> Vec<AggregationPlan<'a>> {
    plan_aggregations_with_depth(start, snapshots, MAX_PREFIX_LEN)
}

pub fn plan_aggregations_with_depth<'a>(
    start: &str,
    snapshots: &'a [Snapshot],
    max_prefix_len: usize,
) -> Vec<AggregationPlan<'a>> {
    let Some(last) = snapshots.last() else {
        return Vec::new();
    };
    let prefix_len = aggregation_prefix_len(start, &last.path, max_prefix_len);

    let mut plans: BTreeMap<String, AggregationPlan<'a>> = BTreeMap::new();
    for snapshot in snapshots {
        let (aggregate, is_partial) = aggregate_target(&snapshot.path, prefix_len);
        let plan = plans
            .entry(aggregate.clone())
            .or_insert_with(|| AggregationPlan {
                aggregate,
                is_partial,
                shards: Vec::new(),
                partials: Vec::new(),
            });
        if is_partial_path(&snapshot.path) {
            plan.partials.push(snapshot);
        } else {
            plan.shards.push(snapshot);
        }
    }
    plans.into_values().collect()
}

/// Depth at which documents between `start` and `end` share a prefix: one
/// past the first differing character, capped at `max_prefix_len`. Zero
/// (straight to the counter) when the keys are not comparable.
pub fn aggregation_prefix_len(start: &str, end: &str, max_prefix_len: usize) -> usize {
    if start.is_empty() || dirname(start) != dirname(end) {
        return 0;
    }
    let first: Vec<char> = decode_shard_key(basename(start)).chars().collect();
    let second: Vec<char> = decode_shard_key(basename(end)).chars().collect();
    if first.len() != second.len() {
        return 0;
    }
    first
        .iter()
        .zip(second.iter())
        .take(max_prefix_len)
        .position(|(a, b)| a != b)
        .map(|idx| idx + 1)
        .unwrap_or(max_prefix_len)
}

/// Where one document aggregates to at `prefix_len`. A document always
/// moves to a strictly shorter prefix than its own key, so a partial is
/// never folded into itself or a sibling at its own depth.
fn aggregate_target(path: &str, prefix_len: usize) -> (String, bool) {
    let counter = counter_path(path).to_string();
    if prefix_len == 0 {
        return (counter, false);
    }
    let key = decode_shard_key(basename(path));
    let target_len = prefix_len.min(key.chars().count().saturating_sub(1));
    if target_len == 0 {
        return (counter, false);
    }
    let partial_key = encode_partial_key(&key_prefix(key, target_len));
    (join(dirname(path), &partial_key), true)
}
