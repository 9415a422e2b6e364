//! Unified configuration for sharded counter workers and controller.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (sharded_counter.toml)
//! ```toml
//! [shards]
//! collection_id = "_counter_shards_"
//! internal_state_path = "_firebase_ext_/sharded_counter"
//!
//! [worker]
//! run_budget_ms = 45000
//!
//! [controller]
//! inline_aggregation_limit = 200
//! slice_width = 20
//! ```
//!
//! Environment variables use the `SHARDED_COUNTER_` prefix with `__`
//! between section and key, e.g. `SHARDED_COUNTER_CONTROLLER__MIN_WORKERS=1`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    /// Where shards and coordination documents live
    pub shards: ShardsConfig,
    /// Aggregation planning
    pub planner: PlannerConfig,
    /// Worker runs
    pub worker: WorkerConfig,
    /// Controller passes and rebalancing
    pub controller: ControllerConfig,
}

impl CounterConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Overrides to apply on top
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CounterConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with SHARDED_COUNTER_ prefix
        figment = figment.merge(Env::prefixed("SHARDED_COUNTER_").split("__"));

        // Layer 3: explicit overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: CounterConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards.collection_id.is_empty() || self.shards.collection_id.contains('/') {
            return Err(ConfigError::new(
                "shards.collection_id must be a single non-empty path segment",
            ));
        }
        let segments = self.shards.internal_state_path.split('/').collect::<Vec<_>>();
        if segments.len() % 2 != 0 || segments.iter().any(|segment| segment.is_empty()) {
            return Err(ConfigError::new(
                "shards.internal_state_path must be a document path",
            ));
        }
        if self.planner.max_prefix_len == 0 || self.planner.max_prefix_len > MAX_SUPPORTED_PREFIX_LEN {
            return Err(ConfigError::new(format!(
                "planner.max_prefix_len must be within 1..={MAX_SUPPORTED_PREFIX_LEN}"
            )));
        }
        for (name, value) in [
            ("worker.shards_limit", self.worker.shards_limit),
            ("worker.sample_every", self.worker.sample_every),
            ("controller.inline_aggregation_limit", self.controller.inline_aggregation_limit),
            ("controller.slice_width", self.controller.slice_width),
        ] {
            if value == 0 {
                return Err(ConfigError::new(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("worker.run_budget_ms", self.worker.run_budget_ms),
            ("controller.interval_ms", self.controller.interval_ms),
            ("controller.stale_after_secs", self.controller.stale_after_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::new(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Partial keys are five characters, so at most four carry the prefix.
const MAX_SUPPORTED_PREFIX_LEN: usize = crate::sharding::MAX_PREFIX_LEN;

/// Document layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    /// Subcollection id for shards and partials
    pub collection_id: String,
    /// Controller document path
    pub internal_state_path: String,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            collection_id: DEFAULT_SHARDS_COLLECTION_ID.to_string(),
            internal_state_path: DEFAULT_INTERNAL_STATE_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Deepest partial prefix
    pub max_prefix_len: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_prefix_len: DEFAULT_MAX_PREFIX_LEN,
        }
    }
}

/// Worker run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Page size of each round's range query
    pub shards_limit: usize,
    /// Wall-clock budget per run in milliseconds
    pub run_budget_ms: u64,
    /// Pause between non-full rounds in milliseconds
    pub round_interval_ms: u64,
    /// Sample every Nth aggregated path as a split point
    pub sample_every: usize,
    /// Compact partials with more update entries than this
    pub compaction_threshold: usize,
    /// Keep empty partials written within this many seconds
    pub frequent_update_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shards_limit: DEFAULT_WORKER_SHARDS_LIMIT,
            run_budget_ms: DEFAULT_WORKER_RUN_BUDGET_MS,
            round_interval_ms: DEFAULT_WORKER_ROUND_INTERVAL_MS,
            sample_every: DEFAULT_SAMPLE_EVERY,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            frequent_update_secs: DEFAULT_FREQUENT_UPDATE_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn run_budget(&self) -> Duration {
        Duration::from_millis(self.run_budget_ms)
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Timer period in milliseconds
    pub interval_ms: u64,
    /// Fan-in threshold for inline aggregation
    pub inline_aggregation_limit: usize,
    /// Split points per new worker slice
    pub slice_width: usize,
    /// Consolidate workers below this many split points each
    pub min_splits_per_worker: usize,
    /// Seconds without a worker update before it is poked
    pub stale_after_secs: u64,
    /// Limit of the extra sampling query for overloaded workers
    pub extra_splits_limit: usize,
    /// Workers kept even when idle
    pub min_workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_CONTROLLER_INTERVAL_MS,
            inline_aggregation_limit: DEFAULT_INLINE_AGGREGATION_LIMIT,
            slice_width: DEFAULT_SLICE_WIDTH,
            min_splits_per_worker: DEFAULT_MIN_SPLITS_PER_WORKER,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            extra_splits_limit: DEFAULT_EXTRA_SPLITS_LIMIT,
            min_workers: DEFAULT_MIN_WORKERS,
        }
    }
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards: Option<ShardsOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_state_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shards_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_budget_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_aggregation_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_workers: Option<usize>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
