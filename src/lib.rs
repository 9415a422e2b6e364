//! # Sharded Counter
//!
//! High-throughput counters over a document store. Clients increment their
//! own shard document; background workers fold shards into partial
//! aggregates and then into the counter, and a controller sizes the worker
//! fleet from the throughput the workers report.
//!
//! The core runs against the [`store::DocumentStore`] trait. [`MemoryStore`]
//! is the in-process implementation used by tests and benches.

pub mod aggregator;
pub mod client;
pub mod config;
pub mod controller;
pub mod memory_store;
pub mod model;
pub mod planner;
pub mod sharding;
pub mod store;
pub mod test_support;
pub mod triggers;
pub mod value;
pub mod worker;

// Re-export main types for convenience
pub use aggregator::{aggregate, AggregateUpdate, NumericUpdate};
pub use client::ShardedCounter;
pub use config::{ConfigError, CounterConfig};
pub use controller::{
    balance_workers, ControllerStatus, RescheduleOutcome, ShardedCounterController,
    WorkerShardingInfo,
};
pub use memory_store::MemoryStore;
pub use model::{ControllerState, Slice, WorkerMetadata, WorkerStats};
pub use planner::{plan_aggregations, AggregationPlan};
pub use store::{DocumentStore, Snapshot, StoreError, Transaction};
pub use triggers::{Dispatcher, DispatcherHandle};
pub use value::{Fields, Number, Value};
pub use worker::{RunReport, ShardedCounterWorker, WorkerExit, WorkerOptions};
