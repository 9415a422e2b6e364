//! Persisted coordination records: worker slices, worker stats and the
//! controller state document.

use crate::value::{from_fields, to_fields, Fields};
use serde::{Deserialize, Serialize};

/// Half-open range `[start, end)` of shard document paths owned by one
/// worker. An empty `start` or `end` means unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slice {
    pub start: String,
    pub end: String,
}

impl Slice {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole shard keyspace.
    pub fn full() -> Self {
        Self::new("", "")
    }
}

/// Summary a worker writes at the end of each successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Epoch milliseconds of the run's end.
    pub last_successful_run: i64,
    pub shards_aggregated: usize,
    /// Aggregated shard paths, sampled every Nth.
    pub splits: Vec<String>,
    pub rounds: u32,
    /// Rounds whose page query hit the limit.
    pub rounds_capped: u32,
}

impl WorkerStats {
    /// Every round came back full, so the worker never caught up. A run
    /// with no rounds is not overloaded.
    pub fn is_overloaded(&self) -> bool {
        self.rounds > 0 && self.rounds == self.rounds_capped
    }
}

/// Body of `{internal}/workers/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    pub slice: Slice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<WorkerStats>,
    /// Epoch milliseconds; bumped on every change to re-trigger the worker.
    pub timestamp: i64,
}

impl WorkerMetadata {
    pub fn new(slice: Slice, timestamp: i64) -> Self {
        Self {
            slice,
            stats: None,
            timestamp,
        }
    }

    pub fn to_fields(&self) -> serde_json::Result<Fields> {
        to_fields(self)
    }

    pub fn from_fields(fields: &Fields) -> serde_json::Result<Self> {
        from_fields(fields)
    }
}

/// Body of the controller document at the internal state path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerState {
    pub workers: Vec<Slice>,
    pub timestamp: i64,
}

impl ControllerState {
    pub fn to_fields(&self) -> serde_json::Result<Fields> {
        to_fields(self)
    }

    pub fn from_fields(fields: &Fields) -> serde_json::Result<Self> {
        from_fields(fields)
    }
}
