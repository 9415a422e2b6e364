//! Trigger glue.
//!
//! Stands in for the host's document and schedule triggers: watches the
//! store's change feed and a timer, and spawns worker runs, inline
//! aggregations and controller passes in response.
//!
//! - worker metadata created or updated: run that worker
//! - shard or partial written: one inline aggregation at a time
//! - timer tick: controller core pass

use crate::config::CounterConfig;
use crate::controller::{ControllerStatus, ShardedCounterController};
use crate::model::Slice;
use crate::sharding::{collection_id, dirname};
use crate::store::{ChangeEvent, ChangeKind, DocumentStore};
use crate::worker::{ShardedCounterWorker, WorkerOptions};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// What a change event should set off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    RunWorker { metadoc_path: String },
    AggregateInline,
}

pub struct Dispatcher {
    store: Arc<dyn DocumentStore>,
    controller: Arc<ShardedCounterController>,
    worker_options: WorkerOptions,
    shards_collection_id: String,
    inline_limit: usize,
    interval: Duration,
    inline_running: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CounterConfig) -> Self {
        let controller = Arc::new(ShardedCounterController::from_config(store.clone(), config));
        Self {
            store,
            controller,
            worker_options: WorkerOptions::from_config(config),
            shards_collection_id: config.shards.collection_id.clone(),
            inline_limit: config.controller.inline_aggregation_limit,
            interval: config.controller.interval(),
            inline_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn controller(&self) -> Arc<ShardedCounterController> {
        self.controller.clone()
    }

    /// Map a change event to the work it triggers, if any.
    pub fn classify(&self, event: &ChangeEvent) -> Option<Trigger> {
        if event.kind == ChangeKind::Deleted {
            // a deleted worker document stops that worker
            return None;
        }
        if dirname(&event.path) == self.controller.workers_path() {
            return Some(Trigger::RunWorker {
                metadoc_path: event.path.clone(),
            });
        }
        if collection_id(&event.path) == self.shards_collection_id {
            return Some(Trigger::AggregateInline);
        }
        None
    }

    /// Start dispatching in the background.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        DispatcherHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Dispatch until `shutdown` flips to true, then wait for in-flight runs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut changes = self.store.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        let mut tasks = JoinSet::new();
        info!("Dispatcher started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let controller = self.controller.clone();
                    tasks.spawn(async move {
                        if let Err(err) = controller.run_core().await {
                            warn!("Controller pass failed: {:#}", err);
                        }
                    });
                }
                event = changes.recv() => match event {
                    Ok(event) => {
                        if let Some(trigger) = self.classify(&event) {
                            self.dispatch(trigger, &mut tasks);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed events are recovered by the next controller tick.
                        warn!("Dispatcher lagged, {} change events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        error!("Dispatched task panicked: {}", err);
                    }
                }
            }
        }

        debug!("Dispatcher draining {} tasks", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("Dispatched task panicked: {}", err);
            }
        }
        info!("Dispatcher stopped");
        Ok(())
    }

    fn dispatch(&self, trigger: Trigger, tasks: &mut JoinSet<()>) {
        match trigger {
            Trigger::RunWorker { metadoc_path } => {
                let store = self.store.clone();
                let options = self.worker_options.clone();
                tasks.spawn(async move {
                    match ShardedCounterWorker::load(store, &metadoc_path, options).await {
                        Ok(Some(worker)) => {
                            if let Err(err) = worker.run().await {
                                warn!("Worker {} failed: {:#}", metadoc_path, err);
                            }
                        }
                        Ok(None) => debug!("Worker {} is gone", metadoc_path),
                        Err(err) => warn!("Failed to start worker {}: {:#}", metadoc_path, err),
                    }
                });
            }
            Trigger::AggregateInline => {
                if self.inline_running.swap(true, Ordering::AcqRel) {
                    return;
                }
                let controller = self.controller.clone();
                let running = self.inline_running.clone();
                let limit = self.inline_limit;
                tasks.spawn(async move {
                    let status = controller.aggregate_once(&Slice::full(), limit).await;
                    if status != ControllerStatus::Success {
                        debug!("Inline aggregation skipped: {:?}", status);
                    }
                    running.store(false, Ordering::Release);
                });
            }
        }
    }
}

/// Handle to a spawned [`Dispatcher`].
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl DispatcherHandle {
    /// Signal shutdown and wait for in-flight work to finish.
    pub async fn shutdown(self) -> Result<()> {
        // the receiver is gone only if the dispatcher already exited
        let _ = self.shutdown.send(true);
        self.task.await?
    }
}
