//! Default constants for sharded counter configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Layout Defaults
// =============================================================================

/// Subcollection holding shards and partials under each counter document.
pub const DEFAULT_SHARDS_COLLECTION_ID: &str = "_counter_shards_";

/// Controller document; worker documents live in its `workers` subcollection.
pub const DEFAULT_INTERNAL_STATE_PATH: &str = "_firebase_ext_/sharded_counter";

/// Subcollection of the controller document holding worker metadata.
pub const WORKERS_COLLECTION: &str = "workers";

// =============================================================================
// Planner Defaults
// =============================================================================

/// Deepest partial prefix (characters of the shard id).
pub const DEFAULT_MAX_PREFIX_LEN: usize = 4;

// =============================================================================
// Worker Defaults
// =============================================================================

/// Documents fetched per worker round.
pub const DEFAULT_WORKER_SHARDS_LIMIT: usize = 100;

/// Wall-clock budget of one worker run (milliseconds).
/// Sized to fit inside a one-minute function execution limit.
pub const DEFAULT_WORKER_RUN_BUDGET_MS: u64 = 45_000;

/// Pause between rounds whose page was not full (milliseconds).
pub const DEFAULT_WORKER_ROUND_INTERVAL_MS: u64 = 1_000;

/// Every Nth aggregated shard path is kept as a split point.
pub const DEFAULT_SAMPLE_EVERY: usize = 100;

/// Partials with more `_updates_` entries than this get compacted.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 10;

/// Partials written within this window are not deleted even if empty.
pub const DEFAULT_FREQUENT_UPDATE_SECS: u64 = 30;

// =============================================================================
// Controller Defaults
// =============================================================================

/// Controller timer period (milliseconds).
pub const DEFAULT_CONTROLLER_INTERVAL_MS: u64 = 60_000;

/// Fan-in threshold: below this many pending documents the controller
/// aggregates inline instead of running workers.
pub const DEFAULT_INLINE_AGGREGATION_LIMIT: usize = 200;

/// Split points per worker slice after a reshard.
pub const DEFAULT_SLICE_WIDTH: usize = 20;

/// Fewer split points than this per worker means the fleet is too big.
pub const DEFAULT_MIN_SPLITS_PER_WORKER: usize = 10;

/// Workers silent for longer than this are considered stalled (seconds).
pub const DEFAULT_STALE_AFTER_SECS: u64 = 90;

/// Cap on the extra sampling query for an overloaded worker.
pub const DEFAULT_EXTRA_SPLITS_LIMIT: usize = 100_000;

/// Workers kept alive even with no load.
pub const DEFAULT_MIN_WORKERS: usize = 0;
