//! Slice worker.
//!
//! A worker is driven by its metadata document under the controller's
//! `workers` collection. Each run polls its slice of the shard keyspace in
//! rounds, folds shards into partials or counters one plan per transaction,
//! and at the end writes stats back to its metadata document. That write is
//! what triggers the next run, so workers are self-scheduling.
//!
//! Every plan transaction re-reads the metadata document. If it changed
//! (the controller resharded or poked the worker) the run stops at once.

use crate::aggregator::{
    aggregate, contains_many_updates, is_empty_partial, partial_sum, subtract_partial,
    AggregateUpdate, PartialEntry,
};
use crate::config::CounterConfig;
use crate::model::{WorkerMetadata, WorkerStats};
use crate::planner::{plan_aggregations_with_depth, AggregationPlan};
use crate::sharding::{is_partial_path, UPDATES_FIELD};
use crate::store::{DocumentStore, RangeQuery, Snapshot, StoreError, Transaction};
use crate::value::{to_fields, Fields, Value};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Tunables of one worker run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub shards_collection_id: String,
    pub shards_limit: usize,
    pub run_budget: Duration,
    pub round_interval: Duration,
    pub sample_every: usize,
    pub compaction_threshold: usize,
    pub frequent_update: chrono::Duration,
    pub max_prefix_len: usize,
    /// Stop as soon as the slice has nothing left to aggregate.
    pub single_run: bool,
}

impl WorkerOptions {
    pub fn from_config(config: &CounterConfig) -> Self {
        Self {
            shards_collection_id: config.shards.collection_id.clone(),
            shards_limit: config.worker.shards_limit,
            run_budget: config.worker.run_budget(),
            round_interval: config.worker.round_interval(),
            sample_every: config.worker.sample_every,
            compaction_threshold: config.worker.compaction_threshold,
            frequent_update: chrono::Duration::seconds(config.worker.frequent_update_secs as i64),
            max_prefix_len: config.planner.max_prefix_len,
            single_run: false,
        }
    }

    pub fn with_single_run(mut self, single_run: bool) -> Self {
        self.single_run = single_run;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_config(&CounterConfig::default())
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Wall-clock budget spent; stats written.
    BudgetExhausted,
    /// Single-run mode found the slice empty; stats written.
    RangeDrained,
    /// Metadata document changed or vanished; nothing written.
    Revoked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub exit: WorkerExit,
    pub stats: WorkerStats,
    /// Plan transactions that failed and were skipped.
    pub plans_failed: usize,
}

enum PlanOutcome {
    /// Shard paths deleted by the plan.
    Applied(Vec<String>),
    Revoked,
}

pub struct ShardedCounterWorker {
    store: Arc<dyn DocumentStore>,
    metadoc_path: String,
    /// Metadata document body as read when the run was scheduled.
    metadata_fields: Fields,
    metadata: WorkerMetadata,
    options: WorkerOptions,
    all_paths: Vec<String>,
    rounds: u32,
    rounds_capped: u32,
    plans_failed: usize,
}

impl ShardedCounterWorker {
    /// Build a worker from a snapshot of its metadata document.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        metadoc: &Snapshot,
        options: WorkerOptions,
    ) -> Result<Self> {
        let fields = metadoc
            .data
            .clone()
            .ok_or_else(|| anyhow!("worker metadata {} does not exist", metadoc.path))?;
        let metadata = WorkerMetadata::from_fields(&fields)
            .with_context(|| format!("malformed worker metadata at {}", metadoc.path))?;
        Ok(Self {
            store,
            metadoc_path: metadoc.path.clone(),
            metadata_fields: fields,
            metadata,
            options,
            all_paths: Vec::new(),
            rounds: 0,
            rounds_capped: 0,
            plans_failed: 0,
        })
    }

    /// Read the metadata document and build a worker, or `None` if it is gone.
    pub async fn load(
        store: Arc<dyn DocumentStore>,
        metadoc_path: &str,
        options: WorkerOptions,
    ) -> Result<Option<Self>> {
        let snapshot = store.get(metadoc_path).await?;
        if !snapshot.exists() {
            return Ok(None);
        }
        Self::new(store, &snapshot, options).map(Some)
    }

    /// Run rounds until the budget is spent, the slice drains (single-run
    /// mode) or ownership is lost.
    #[instrument(skip(self), fields(worker = %self.metadoc_path), level = "debug")]
    pub async fn run(mut self) -> Result<RunReport> {
        let started = Instant::now();
        let query = RangeQuery::new(
            self.options.shards_collection_id.clone(),
            &self.metadata.slice,
            self.options.shards_limit,
        );

        let mut exit = loop {
            let elapsed = started.elapsed();
            if elapsed >= self.options.run_budget {
                break WorkerExit::BudgetExhausted;
            }
            if !self.owns_slice().await? {
                info!("Worker {} metadata changed, shutting down", self.metadoc_path);
                break WorkerExit::Revoked;
            }

            let page = self
                .store
                .query(&query)
                .await
                .with_context(|| format!("range query for worker {} failed", self.metadoc_path))?;
            if self.options.single_run && page.is_empty() {
                debug!("Slice drained, single run mode");
                break WorkerExit::RangeDrained;
            }

            self.rounds += 1;
            let capped = page.len() >= self.options.shards_limit;
            if capped {
                self.rounds_capped += 1;
            }

            if self.aggregate_round(&page).await == RoundOutcome::Revoked {
                info!("Worker {} lost its slice mid-round", self.metadoc_path);
                break WorkerExit::Revoked;
            }

            if !capped {
                let remaining = self.options.run_budget.saturating_sub(started.elapsed());
                tokio::time::sleep(self.options.round_interval.min(remaining)).await;
            }
        };

        let stats = self.stats();
        if exit != WorkerExit::Revoked && !self.write_stats(&stats).await? {
            exit = WorkerExit::Revoked;
        }
        info!(
            exit = ?exit,
            shards = stats.shards_aggregated,
            rounds = stats.rounds,
            rounds_capped = stats.rounds_capped,
            plans_failed = self.plans_failed,
            "Worker run finished"
        );
        Ok(RunReport {
            exit,
            stats,
            plans_failed: self.plans_failed,
        })
    }

    async fn owns_slice(&self) -> Result<bool> {
        let snapshot = self.store.get(&self.metadoc_path).await?;
        Ok(snapshot.data.as_ref() == Some(&self.metadata_fields))
    }

    async fn aggregate_round(&mut self, page: &[Snapshot]) -> RoundOutcome {
        let (to_aggregate, to_cleanup) = self.categorize(page);

        for partial in &to_cleanup {
            if let Err(err) = self.cleanup_partial(partial).await {
                warn!("Cleanup of partial {:?} failed, skipping: {}", partial.path, err);
            }
        }

        let plans =
            plan_aggregations_with_depth(&self.metadata.slice.start, &to_aggregate, self.options.max_prefix_len);
        for plan in &plans {
            match self.apply_plan(plan).await {
                Ok(PlanOutcome::Applied(paths)) => self.all_paths.extend(paths),
                Ok(PlanOutcome::Revoked) => return RoundOutcome::Revoked,
                Err(err) => {
                    self.plans_failed += 1;
                    warn!("Transaction to {:?} failed, skipping: {}", plan.aggregate, err);
                }
            }
        }
        RoundOutcome::Continue
    }

    /// Split a page into documents to aggregate and partials to clean up.
    /// Empty partials are never aggregated; they are deleted once they stop
    /// receiving updates. Oversized partials are both compacted and
    /// aggregated.
    fn categorize(&self, page: &[Snapshot]) -> (Vec<Snapshot>, Vec<Snapshot>) {
        let now = Utc::now();
        let mut to_aggregate = Vec::with_capacity(page.len());
        let mut to_cleanup = Vec::new();
        for snapshot in page {
            let Some(data) = snapshot.data.as_ref() else {
                continue;
            };
            if is_partial_path(&snapshot.path) && is_empty_partial(data) {
                let updated_recently = snapshot
                    .update_time
                    .map(|time| now - time < self.options.frequent_update)
                    .unwrap_or(false);
                if !updated_recently || self.options.single_run {
                    to_cleanup.push(snapshot.clone());
                }
                continue;
            }
            if contains_many_updates(data, self.options.compaction_threshold) {
                to_cleanup.push(snapshot.clone());
            }
            to_aggregate.push(snapshot.clone());
        }
        (to_aggregate, to_cleanup)
    }

    /// Delete an empty partial, or rewrite a long one as a single entry.
    async fn cleanup_partial(&self, partial: &Snapshot) -> Result<(), StoreError> {
        let mut txn = Transaction::new(self.store.as_ref());
        let snapshot = txn.get(&partial.path).await?;
        let Some(data) = snapshot.data.as_ref() else {
            return Ok(());
        };
        if is_empty_partial(data) {
            debug!("Deleting empty partial {:?}", snapshot.path);
            txn.delete(&snapshot.path);
        } else {
            let entry = PartialEntry::new(partial_sum(data));
            let mut compacted = Fields::new();
            compacted.insert(UPDATES_FIELD.to_string(), Value::Array(vec![entry.to_value()]));
            debug!("Compacting partial {:?}", snapshot.path);
            txn.set(&snapshot.path, compacted);
        }
        txn.commit().await
    }

    /// One atomic aggregation: write the target, delete the consumed shards
    /// and decrement the consumed partials.
    async fn apply_plan(&self, plan: &AggregationPlan<'_>) -> Result<PlanOutcome, StoreError> {
        let mut txn = Transaction::new(self.store.as_ref());

        let metadoc = txn.get(&self.metadoc_path).await?;
        if metadoc.data.as_ref() != Some(&self.metadata_fields) {
            return Ok(PlanOutcome::Revoked);
        }

        let counter = if plan.is_partial {
            None
        } else {
            Some(txn.get(&plan.aggregate).await?)
        };

        // Partials are not read here: they are only ever appended to.
        let shard_paths: Vec<String> = plan.shards.iter().map(|shard| shard.path.clone()).collect();
        let shards = if shard_paths.is_empty() {
            Vec::new()
        } else {
            txn.get_all(&shard_paths).await?
        };

        match aggregate(counter.as_ref(), &plan.partials, &shards) {
            AggregateUpdate::Counter(fields) => {
                if !fields.is_empty() {
                    let fields = fields
                        .into_iter()
                        .map(|(path, number)| (path, Value::from(number)))
                        .collect();
                    txn.merge(&plan.aggregate, fields);
                }
            }
            AggregateUpdate::Partial(update) => {
                if !update.is_noop() {
                    let entry = PartialEntry::new(update);
                    txn.array_union(&plan.aggregate, UPDATES_FIELD, vec![entry.to_value()]);
                }
            }
        }

        let mut paths = Vec::with_capacity(shards.len());
        for shard in shards.iter().filter(|shard| shard.exists()) {
            paths.push(shard.path.clone());
            txn.delete(&shard.path);
        }

        for partial in plan.partials.iter().filter(|partial| partial.exists()) {
            let decrement = subtract_partial(partial);
            if !decrement.is_empty() {
                let entry = PartialEntry::new(decrement);
                txn.array_union(&partial.path, UPDATES_FIELD, vec![entry.to_value()]);
            }
        }

        txn.commit().await?;
        debug!(
            "Aggregated {} shards and {} partials into {:?}",
            paths.len(),
            plan.partials.len(),
            plan.aggregate
        );
        Ok(PlanOutcome::Applied(paths))
    }

    fn stats(&mut self) -> WorkerStats {
        self.all_paths.sort();
        let sample_every = self.options.sample_every.max(1);
        let splits = self
            .all_paths
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != 0 && idx % sample_every == 0)
            .map(|(_, path)| path.clone())
            .collect();
        WorkerStats {
            last_successful_run: Utc::now().timestamp_millis(),
            shards_aggregated: self.all_paths.len(),
            splits,
            rounds: self.rounds,
            rounds_capped: self.rounds_capped,
        }
    }

    /// Record stats if the metadata is still ours. The write bumps the
    /// timestamp, which schedules the next run.
    async fn write_stats(&self, stats: &WorkerStats) -> Result<bool> {
        let mut txn = Transaction::new(self.store.as_ref());
        let metadoc = txn.get(&self.metadoc_path).await?;
        if metadoc.data.as_ref() != Some(&self.metadata_fields) {
            return Ok(false);
        }
        txn.merge(
            &self.metadoc_path,
            vec![
                ("timestamp".to_string(), Value::from(Utc::now().timestamp_millis())),
                ("stats".to_string(), Value::Map(to_fields(stats)?)),
            ],
        );
        match txn.commit().await {
            Ok(()) => Ok(true),
            Err(StoreError::Aborted { .. }) => Ok(false),
            Err(err) => Err(err).context("failed to save worker stats"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundOutcome {
    Continue,
    Revoked,
}
