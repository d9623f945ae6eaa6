//! Priority scheduler for dependency-aware batch dispatch.
//!
//! The Scheduler owns every task from insertion to completion. Ready tasks
//! live in a binary heap ordered by urgency; tasks waiting on prerequisites
//! live in the dependency graph's blocked index and are promoted when their
//! last blocker completes. `get_ready` hands out batches bounded by count,
//! summed estimated duration and target exclusivity.
//!
//! The structure is single-writer: only the orchestrator mutates it, so there
//! is no internal locking.

use crate::core::dag::DependencyGraph;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::mlog_trace;
use crate::orchestration::estimator::DurationEstimator;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Heap key: urgency first, then large and slow items early within a class,
/// then fewer retries, then insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: crate::core::task::Priority,
    complexity: Reverse<u32>,
    estimate: Reverse<Duration>,
    retry_count: u32,
    id: TaskId,
}

impl ReadyKey {
    fn of(task: &Task) -> Self {
        Self {
            priority: task.priority,
            complexity: Reverse(task.complexity),
            estimate: Reverse(task.estimated_duration),
            retry_count: task.retry_count,
            id: task.id,
        }
    }
}

/// A task that has been reported back.
#[derive(Debug, Clone)]
pub struct CompletedTask {
    pub task: Task,
    pub success: bool,
    pub duration: Duration,
}

/// A queued task and the prerequisites it still waits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: TaskId,
    pub label: String,
    /// Empty when the task is ready.
    pub waiting_on: Vec<TaskId>,
}

/// Priority scheduler.
///
/// # Example
///
/// ```
/// use mend::core::{Priority, Task, TaskType};
/// use mend::orchestration::Scheduler;
/// use std::time::Duration;
///
/// let mut scheduler = Scheduler::new();
/// let lint = scheduler.add(Task::new(TaskType::FixLint, Priority::Normal)).unwrap();
/// let fmt = scheduler
///     .add(Task::new(TaskType::Format, Priority::Normal).depends_on(lint))
///     .unwrap();
///
/// let batch = scheduler.get_ready(4, Duration::from_secs(60));
/// assert_eq!(batch.len(), 1);
/// assert_eq!(batch[0].id, lint);
///
/// scheduler.mark_completed(lint, Duration::from_secs(1), true).unwrap();
/// let batch = scheduler.get_ready(4, Duration::from_secs(60));
/// assert_eq!(batch[0].id, fmt);
/// ```
pub struct Scheduler {
    next_id: u64,
    /// Ids handed out by `reserve_id` and not yet consumed by `add`.
    reserved: HashSet<TaskId>,
    /// Queued tasks, ready or blocked.
    queued: HashMap<TaskId, Task>,
    ready: BinaryHeap<Reverse<ReadyKey>>,
    graph: DependencyGraph,
    running: HashMap<TaskId, Task>,
    completed: HashMap<TaskId, CompletedTask>,
    /// Targets of running tasks.
    busy_targets: HashSet<PathBuf>,
    estimator: DurationEstimator,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_estimator(DurationEstimator::new())
    }

    pub fn with_estimator(estimator: DurationEstimator) -> Self {
        Self {
            next_id: 1,
            reserved: HashSet::new(),
            queued: HashMap::new(),
            ready: BinaryHeap::new(),
            graph: DependencyGraph::new(),
            running: HashMap::new(),
            completed: HashMap::new(),
            busy_targets: HashSet::new(),
            estimator,
        }
    }

    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Reserve the id a task will get when it is added later.
    ///
    /// Lets a dependent be submitted before its prerequisite. Pass the
    /// reserved id as the prerequisite's `id` when adding it.
    pub fn reserve_id(&mut self) -> TaskId {
        let id = self.allocate_id();
        self.reserved.insert(id);
        id
    }

    /// Insert a task and return its id.
    ///
    /// Tasks with `TaskId::UNASSIGNED` get a fresh id; a task carrying a
    /// reserved id consumes the reservation. Any other id is rejected so a
    /// task is never inserted twice.
    pub fn add(&mut self, mut task: Task) -> Result<TaskId> {
        let id = if !task.id.is_assigned() {
            self.allocate_id()
        } else if self.reserved.remove(&task.id) {
            task.id
        } else {
            return Err(Error::Validation(format!(
                "task {} already has an id that was not reserved",
                task.id
            )));
        };
        task.id = id;
        self.estimator.refine(&mut task);

        let dependencies: Vec<TaskId> = task.dependencies.iter().copied().collect();
        let completed = &self.completed;
        let ready = self
            .graph
            .register(id, &dependencies, |dep| completed.contains_key(&dep));
        if ready {
            self.ready.push(Reverse(ReadyKey::of(&task)));
        }
        mlog_trace!(
            "scheduler: add {} ({}, {}, ready={})",
            id,
            task.label(),
            task.priority,
            ready
        );
        self.queued.insert(id, task);
        Ok(id)
    }

    /// Pop up to `max_tasks` dispatchable tasks.
    ///
    /// A candidate is taken when its target is not in flight (nor already in
    /// this batch) and the batch's summed estimate stays within
    /// `max_total_duration`. A task whose own estimate exceeds the cap is
    /// returned alone when it would be first in the batch. Skipped
    /// candidates go back to the heap. Returned tasks are Dispatched.
    pub fn get_ready(&mut self, max_tasks: usize, max_total_duration: Duration) -> Vec<Task> {
        self.get_ready_where(max_tasks, max_total_duration, |_| true)
    }

    /// `get_ready` restricted to tasks accepted by `admit`.
    ///
    /// Rejected tasks stay queued and ready for a later call.
    pub fn get_ready_where<F>(&mut self, max_tasks: usize, max_total_duration: Duration, admit: F) -> Vec<Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut batch: Vec<Task> = Vec::new();
        let mut deferred = Vec::new();
        let mut total = Duration::ZERO;
        let mut batch_targets: HashSet<PathBuf> = HashSet::new();

        while batch.len() < max_tasks {
            let Some(Reverse(key)) = self.ready.pop() else {
                break;
            };
            let Some(task) = self.queued.get(&key.id) else {
                continue;
            };
            if !admit(task) {
                deferred.push(key);
                continue;
            }

            if let Some(target) = &task.target {
                if self.busy_targets.contains(target) || batch_targets.contains(target) {
                    deferred.push(key);
                    continue;
                }
            }

            let estimate = task.estimated_duration;
            let oversized_alone = batch.is_empty() && estimate > max_total_duration;
            if !oversized_alone && total + estimate > max_total_duration {
                deferred.push(key);
                continue;
            }

            let Some(task) = self.queued.remove(&key.id) else {
                continue;
            };
            if let Some(target) = &task.target {
                batch_targets.insert(target.clone());
            }
            total += estimate;
            batch.push(task);
            if oversized_alone {
                break;
            }
        }

        for key in deferred {
            self.ready.push(Reverse(key));
        }
        for task in &batch {
            if let Some(target) = &task.target {
                self.busy_targets.insert(target.clone());
            }
            self.running.insert(task.id, task.clone());
        }
        batch
    }

    /// Move a dispatched task to completed and release its dependents.
    ///
    /// Failure completes the task too: dependents run regardless, and a
    /// retry is a new task the orchestrator adds explicitly.
    pub fn mark_completed(&mut self, id: TaskId, duration: Duration, success: bool) -> Result<()> {
        let task = self.running.remove(&id).ok_or(Error::TaskNotRunning { id })?;
        if let Some(target) = &task.target {
            self.busy_targets.remove(target);
        }
        self.estimator.record(task.task_type, task.priority, duration);

        for released in self.graph.complete(id) {
            if let Some(dependent) = self.queued.get(&released) {
                self.ready.push(Reverse(ReadyKey::of(dependent)));
            }
        }
        mlog_trace!("scheduler: completed {} success={} in {:?}", id, success, duration);

        self.completed.insert(
            id,
            CompletedTask {
                task,
                success,
                duration,
            },
        );
        Ok(())
    }

    /// Complete a failed task and queue `retry` in its place.
    ///
    /// Dependents still waiting on the failed attempt wait on the retry
    /// instead, so a chain keeps its order across attempts.
    pub fn retry(&mut self, id: TaskId, duration: Duration, retry: Task) -> Result<TaskId> {
        if !self.running.contains_key(&id) {
            return Err(Error::TaskNotRunning { id });
        }
        let retry_id = self.add(retry)?;
        for dependent in self.graph.hand_over(id, retry_id) {
            if let Some(task) = self.queued.get_mut(&dependent) {
                task.dependencies.insert(retry_id);
            }
        }
        self.mark_completed(id, duration, false)?;
        Ok(retry_id)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        if self.queued.contains_key(&id) {
            Some(TaskStatus::Queued)
        } else if self.running.contains_key(&id) {
            Some(TaskStatus::Dispatched)
        } else {
            self.completed
                .get(&id)
                .map(|c| TaskStatus::Completed { success: c.success })
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.queued
            .get(&id)
            .or_else(|| self.running.get(&id))
            .or_else(|| self.completed.get(&id).map(|c| &c.task))
    }

    pub fn completed(&self, id: TaskId) -> Option<&CompletedTask> {
        self.completed.get(&id)
    }

    /// Queued tasks (ready or blocked).
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.graph.blocked_count()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty()
    }

    /// Whether some queued or running task targets `target`.
    pub fn has_work_for(&self, target: &Path) -> bool {
        self.busy_targets.contains(target)
            || self
                .queued
                .values()
                .any(|t| t.target.as_deref() == Some(target))
    }

    /// Every queued task, sorted by id.
    pub fn pending(&self) -> Vec<PendingTask> {
        let mut pending: Vec<PendingTask> = self
            .queued
            .values()
            .map(|task| PendingTask {
                id: task.id,
                label: task.label(),
                waiting_on: self.graph.waiting_on(task.id),
            })
            .collect();
        pending.sort_by_key(|p| p.id);
        pending
    }

    /// Dependency cycles among blocked tasks.
    pub fn cycles(&self) -> Vec<Vec<TaskId>> {
        self.graph.cycles()
    }

    pub fn estimator(&self) -> &DurationEstimator {
        &self.estimator
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.queued.len())
            .field("ready", &self.ready.len())
            .field("running", &self.running.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}
