//! Worker fleet controller.
//!
//! Runs on a timer. With little traffic it folds shards straight into their
//! counters inline. Otherwise it sizes and supervises the worker fleet:
//! worker stats are turned into a global list of split points, the list is
//! cut into slices, and stalled workers are poked by touching their
//! metadata document. Every decision is re-derived from the persisted
//! documents; nothing is kept between passes.

use crate::aggregator::{aggregate, AggregateUpdate};
use crate::config::{CounterConfig, WORKERS_COLLECTION};
use crate::model::{ControllerState, Slice, WorkerMetadata};
use crate::planner::plan_aggregations;
use crate::sharding::{encode_worker_key, join};
use crate::store::{DocumentStore, RangeQuery, StoreError, Transaction};
use crate::value::Value;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Balancing view of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerShardingInfo {
    pub slice: Slice,
    /// The worker completed at least one run.
    pub has_data: bool,
    pub overloaded: bool,
    /// Sampled paths inside the slice, ascending.
    pub splits: Vec<String>,
}

impl WorkerShardingInfo {
    pub fn from_metadata(metadata: &WorkerMetadata) -> Self {
        match &metadata.stats {
            None => Self {
                slice: metadata.slice.clone(),
                has_data: false,
                overloaded: false,
                splits: Vec::new(),
            },
            Some(stats) => Self {
                slice: metadata.slice.clone(),
                has_data: true,
                overloaded: stats.is_overloaded(),
                splits: stats.splits.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceOptions {
    /// Splits per slice when cutting new slices.
    pub slice_width: usize,
    /// Fewer splits per worker than this consolidates the fleet.
    pub min_splits_per_worker: usize,
}

impl Default for BalanceOptions {
    fn default() -> Self {
        Self {
            slice_width: crate::config::DEFAULT_SLICE_WIDTH,
            min_splits_per_worker: crate::config::DEFAULT_MIN_SPLITS_PER_WORKER,
        }
    }
}

/// Decide whether the fleet needs resharding and, if so, the new slices.
pub fn balance_workers(
    workers: &[WorkerShardingInfo],
    min_workers: usize,
    options: BalanceOptions,
) -> (bool, Vec<Slice>) {
    if workers.is_empty() {
        return if min_workers > 0 {
            (true, vec![Slice::full()])
        } else {
            (false, Vec::new())
        };
    }
    // Wait until every worker has reported before moving boundaries.
    if workers.iter().any(|worker| !worker.has_data) {
        return (false, Vec::new());
    }

    let mut splits: Vec<String> = Vec::new();
    let mut reshard = false;
    for worker in workers {
        splits.push(worker.slice.start.clone());
        splits.extend(worker.splits.iter().cloned());
        reshard |= worker.overloaded;
    }
    if let Some(last) = workers.last() {
        splits.push(last.slice.end.clone());
    }

    if splits.len() < options.min_splits_per_worker * workers.len() && workers.len() > 1 {
        reshard = true;
    }
    if splits.len() <= 2 && min_workers == 0 {
        return (true, Vec::new());
    }

    let width = options.slice_width.max(1);
    let last = splits.len() - 1;
    let slices = (0..last)
        .step_by(width)
        .map(|i| Slice::new(splits[i].clone(), splits[(i + width).min(last)].clone()))
        .collect();
    (reshard, slices)
}

/// Result of one inline aggregation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Workers own the keyspace; nothing done inline.
    WorkersRunning,
    /// Too many documents pending to aggregate inline.
    TooManyShards,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RescheduleOutcome {
    Resharded { previous: usize, workers: Vec<Slice> },
    /// Fleet unchanged; `failures` stalled workers were poked.
    Monitored { failures: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    pub shards_collection_id: String,
    pub inline_aggregation_limit: usize,
    pub balance: BalanceOptions,
    pub stale_after: chrono::Duration,
    pub sample_every: usize,
    pub extra_splits_limit: usize,
    pub min_workers: usize,
}

impl ControllerOptions {
    pub fn from_config(config: &CounterConfig) -> Self {
        Self {
            shards_collection_id: config.shards.collection_id.clone(),
            inline_aggregation_limit: config.controller.inline_aggregation_limit,
            balance: BalanceOptions {
                slice_width: config.controller.slice_width,
                min_splits_per_worker: config.controller.min_splits_per_worker,
            },
            stale_after: config.controller.stale_after(),
            sample_every: config.worker.sample_every,
            extra_splits_limit: config.controller.extra_splits_limit,
            min_workers: config.controller.min_workers,
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&CounterConfig::default())
    }
}

pub struct ShardedCounterController {
    store: Arc<dyn DocumentStore>,
    controller_path: String,
    workers_path: String,
    options: ControllerOptions,
}

impl ShardedCounterController {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        controller_path: impl Into<String>,
        options: ControllerOptions,
    ) -> Self {
        let controller_path = controller_path.into();
        let workers_path = join(&controller_path, WORKERS_COLLECTION);
        Self {
            store,
            controller_path,
            workers_path,
            options,
        }
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, config: &CounterConfig) -> Self {
        Self::new(
            store,
            config.shards.internal_state_path.clone(),
            ControllerOptions::from_config(config),
        )
    }

    /// Collection holding worker metadata documents.
    pub fn workers_path(&self) -> &str {
        &self.workers_path
    }

    /// Timer entry point: aggregate inline when traffic is low, otherwise
    /// rebalance and supervise workers.
    #[instrument(skip(self), level = "debug")]
    pub async fn run_core(&self) -> Result<ControllerStatus> {
        let status = self
            .aggregate_once(&Slice::full(), self.options.inline_aggregation_limit)
            .await;
        if status != ControllerStatus::Success {
            // Inline aggregation that cannot keep up hands off to workers.
            let min_workers = match status {
                ControllerStatus::TooManyShards | ControllerStatus::Failure => {
                    self.options.min_workers.max(1)
                }
                _ => self.options.min_workers,
            };
            self.reschedule_workers(min_workers).await?;
        }
        Ok(status)
    }

    /// Fold up to `limit` pending documents in `slice` straight into their
    /// counters, in one transaction.
    #[instrument(skip(self), level = "debug")]
    pub async fn aggregate_once(&self, slice: &Slice, limit: usize) -> ControllerStatus {
        match self.try_aggregate_once(slice, limit).await {
            Ok(status) => status,
            Err(err) => {
                warn!("Transaction to aggregate shards failed: {:#}", err);
                ControllerStatus::Failure
            }
        }
    }

    async fn try_aggregate_once(&self, slice: &Slice, limit: usize) -> Result<ControllerStatus> {
        let mut txn = Transaction::new(self.store.as_ref());
        let controller_doc = txn
            .get(&self.controller_path)
            .await
            .context("failed to read controller doc")?;
        let state = match controller_doc.data.as_ref() {
            Some(fields) => ControllerState::from_fields(fields)?,
            None => ControllerState::default(),
        };
        if !state.workers.is_empty() {
            return Ok(ControllerStatus::WorkersRunning);
        }

        let query = RangeQuery::new(self.options.shards_collection_id.clone(), slice, limit);
        let shards = txn
            .query(&query)
            .await
            .context("query to find shards to aggregate failed")?;
        if shards.len() >= limit {
            return Ok(ControllerStatus::TooManyShards);
        }

        let plans = plan_aggregations("", &shards);
        for plan in &plans {
            if plan.is_partial {
                bail!("inline aggregation planned partial {:?}", plan.aggregate);
            }
            let counter = txn
                .get(&plan.aggregate)
                .await
                .with_context(|| format!("failed to read counter {}", plan.aggregate))?;
            let shards: Vec<_> = plan.shards.iter().map(|shard| (*shard).clone()).collect();
            if let AggregateUpdate::Counter(fields) = aggregate(Some(&counter), &plan.partials, &shards) {
                if !fields.is_empty() {
                    let fields = fields
                        .into_iter()
                        .map(|(path, number)| (path, Value::from(number)))
                        .collect();
                    txn.merge(&plan.aggregate, fields);
                }
            }
            for doc in plan.shards.iter().chain(plan.partials.iter()) {
                txn.delete(&doc.path);
            }
        }

        let now = Utc::now().timestamp_millis();
        if controller_doc.exists() {
            txn.merge(&self.controller_path, vec![("timestamp".to_string(), Value::from(now))]);
        } else {
            let state = ControllerState {
                workers: Vec::new(),
                timestamp: now,
            };
            txn.set(&self.controller_path, state.to_fields()?);
        }
        txn.commit().await?;
        info!("Aggregated {} counters inline", plans.len());
        Ok(ControllerStatus::Success)
    }

    /// Rebalance or supervise workers based on their reported stats.
    pub async fn reschedule_workers(&self, min_workers: usize) -> Result<RescheduleOutcome> {
        self.reschedule_workers_at(Utc::now(), min_workers).await
    }

    /// [`Self::reschedule_workers`] with an explicit clock, for stall
    /// detection against a known time.
    #[instrument(skip(self), level = "debug")]
    pub async fn reschedule_workers_at(
        &self,
        now: DateTime<Utc>,
        min_workers: usize,
    ) -> Result<RescheduleOutcome> {
        let mut txn = Transaction::new(self.store.as_ref());
        // Read the controller doc so concurrent passes conflict.
        let controller_doc = txn
            .get(&self.controller_path)
            .await
            .context("failed to read controller doc")?;
        let worker_docs = txn
            .list(&self.workers_path)
            .await
            .context("failed to read worker docs")?;

        let mut sharding_info = Vec::with_capacity(worker_docs.len());
        for doc in &worker_docs {
            let Some(fields) = doc.data.as_ref() else {
                continue;
            };
            let metadata = WorkerMetadata::from_fields(fields)
                .with_context(|| format!("malformed worker metadata at {}", doc.path))?;
            let mut info = WorkerShardingInfo::from_metadata(&metadata);
            if info.overloaded && !info.splits.is_empty() {
                if let Err(err) = self.extend_splits(&mut info).await {
                    warn!("Failed to calculate additional splits for worker {}: {}", doc.id(), err);
                }
            }
            sharding_info.push(info);
        }

        let (reshard, slices) = balance_workers(&sharding_info, min_workers, self.options.balance);
        let timestamp = now.timestamp_millis();
        let outcome = if reshard {
            info!(
                "Resharding workers, new workers: {} prev num workers: {}",
                slices.len(),
                worker_docs.len()
            );
            for doc in &worker_docs {
                txn.delete(&doc.path);
            }
            for (index, slice) in slices.iter().enumerate() {
                let metadata = WorkerMetadata::new(slice.clone(), timestamp);
                txn.set(join(&self.workers_path, &encode_worker_key(index)), metadata.to_fields()?);
            }
            let state = ControllerState {
                workers: slices.clone(),
                timestamp,
            };
            txn.set(&self.controller_path, state.to_fields()?);
            RescheduleOutcome::Resharded {
                previous: worker_docs.len(),
                workers: slices,
            }
        } else {
            let mut failures = 0;
            for doc in &worker_docs {
                let stalled = doc
                    .update_time
                    .map(|updated| now - updated > self.options.stale_after)
                    .unwrap_or(false);
                if stalled {
                    txn.merge(&doc.path, vec![("timestamp".to_string(), Value::from(timestamp))]);
                    failures += 1;
                }
            }
            info!("Detected {} failed workers", failures);
            if controller_doc.exists() {
                txn.merge(&self.controller_path, vec![("timestamp".to_string(), Value::from(timestamp))]);
            } else {
                let state = ControllerState {
                    workers: Vec::new(),
                    timestamp,
                };
                txn.set(&self.controller_path, state.to_fields()?);
            }
            RescheduleOutcome::Monitored { failures }
        };

        txn.commit().await.map_err(|err| match err {
            StoreError::Aborted { path } => {
                anyhow::anyhow!("concurrent controller pass changed {path}, rebalance abandoned")
            }
            other => anyhow::Error::from(other),
        })?;
        Ok(outcome)
    }

    /// An overloaded worker's samples stop where its run did. Sample the
    /// rest of its slice so the new slices cover it evenly.
    async fn extend_splits(&self, info: &mut WorkerShardingInfo) -> Result<(), StoreError> {
        let Some(last) = info.splits.last().cloned() else {
            return Ok(());
        };
        let query = RangeQuery {
            collection_id: self.options.shards_collection_id.clone(),
            start: last,
            end: info.slice.end.clone(),
            limit: self.options.extra_splits_limit,
        };
        let docs = self.store.query(&query).await?;
        let sample_every = self.options.sample_every.max(1);
        let extra = docs
            .iter()
            .skip(sample_every)
            .step_by(sample_every)
            .map(|doc| doc.path.clone());
        info.splits.extend(extra);
        debug!("Worker slice {:?} now has {} splits", info.slice, info.splits.len());
        Ok(())
    }
}
