//! Worker pool for batch dispatch.
//!
//! The `WorkerPool` owns one worker per kind and bounds how many tasks a
//! batch may hold. A batch is dispatched concurrently and awaited as a unit;
//! each task is bounded by its own time budget, so a hung tool surfaces as a
//! failed result instead of stalling the batch.

use crate::config::Config;
use crate::core::task::{Task, TaskResult, TaskType};
use crate::error::Result;
use crate::mlog_warn;
use crate::orchestration::orchestrator::RunEvent;
use crate::orchestration::worker::{Worker, WorkerKind, WorkerStats};
use crate::runner::CommandRunner;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

/// One worker per kind plus the batch capacity.
///
/// # Example
///
/// ```
/// use mend::orchestration::{WorkerKind, WorkerPool};
///
/// let mut pool = WorkerPool::new(2, 4);
/// assert_eq!(pool.capacity(), 2);
/// assert_eq!(pool.widen(WorkerKind::Lint, 5), 4);
/// ```
pub struct WorkerPool {
    /// Workers indexed by kind.
    workers: BTreeMap<WorkerKind, Arc<Worker>>,
    /// Maximum tasks per batch.
    capacity: usize,
    /// Ceiling for `capacity` under escalation.
    max_capacity: usize,
    /// Channel for task progress events.
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl WorkerPool {
    /// Create an empty pool.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of tasks per batch
    /// * `max_capacity` - Ceiling the capacity may grow to under escalation
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            workers: BTreeMap::new(),
            capacity,
            max_capacity: max_capacity.max(capacity),
            event_tx: None,
        }
    }

    /// Build the full set of workers for a run.
    ///
    /// Every kind gets a worker with `pool_size` lanes, its configured output
    /// patterns and its escalation variants.
    pub fn from_config(config: &Config, root: &Path, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let capacity = config.run.pool_size();
        let mut pool = Self::new(capacity, config.run.max_pool_size);
        for kind in WorkerKind::ALL {
            let worker = Worker::new(kind, Arc::clone(&runner), root, capacity)
                .with_patterns(config.patterns_for(kind)?)
                .with_escalation(config.escalation_for(kind))
                .with_command_timeout(config.run.command_timeout());
            pool.insert(worker);
        }
        Ok(pool)
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<RunEvent>) -> Self {
        self.set_event_sender(event_tx);
        self
    }

    pub fn set_event_sender(&mut self, event_tx: mpsc::Sender<RunEvent>) {
        self.event_tx = Some(event_tx);
    }

    /// Add or replace the worker for its kind.
    pub fn insert(&mut self, worker: Worker) {
        self.workers.insert(worker.kind(), Arc::new(worker));
    }

    pub fn worker(&self, kind: WorkerKind) -> Option<&Arc<Worker>> {
        self.workers.get(&kind)
    }

    pub fn worker_for(&self, task_type: TaskType) -> Option<&Arc<Worker>> {
        self.worker(WorkerKind::for_task(task_type))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Give `kind` more lanes and grow the batch capacity up to the ceiling.
    ///
    /// # Returns
    ///
    /// The new capacity.
    pub fn widen(&mut self, kind: WorkerKind, extra: usize) -> usize {
        if let Some(worker) = self.workers.get(&kind) {
            worker.widen(extra);
        }
        self.capacity = (self.capacity + extra).min(self.max_capacity);
        self.capacity
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            // Progress only; a slow consumer loses events rather than stalling a batch.
            let _ = tx.try_send(event);
        }
    }

    async fn run_one(&self, task: &Task) -> TaskResult {
        let started = Instant::now();
        let Some(worker) = self.worker_for(task.task_type) else {
            return TaskResult::failed(task, format!("no worker for {}", task.task_type), started.elapsed());
        };

        self.emit(RunEvent::TaskStarted {
            id: task.id,
            label: task.label(),
        });
        let budget = worker.time_budget(task);
        let result = match timeout(budget, worker.process(task)).await {
            Ok(result) => result,
            Err(_) => {
                mlog_warn!("{} exceeded its budget of {:?}", task.label(), budget);
                TaskResult::failed(
                    task,
                    format!("{} timed out after {}s", task.label(), budget.as_secs()),
                    started.elapsed(),
                )
            }
        };
        self.emit(RunEvent::TaskFinished {
            id: task.id,
            label: task.label(),
            success: result.success,
            score: result.quality_score,
        });
        result
    }

    /// Run a batch concurrently and wait for every task.
    ///
    /// Results come back in batch order.
    pub async fn dispatch(&self, batch: &[Task]) -> Vec<TaskResult> {
        join_all(batch.iter().map(|task| self.run_one(task))).await
    }

    /// Snapshot of every worker's statistics.
    pub async fn stats(&self) -> BTreeMap<WorkerKind, WorkerStats> {
        let mut stats = BTreeMap::new();
        for (kind, worker) in &self.workers {
            stats.insert(*kind, worker.stats().await);
        }
        stats
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.keys().collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}
