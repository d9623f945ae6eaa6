//! Run health: stagnation and stalled tasks.
//!
//! The `StagnationTracker` watches the overall score across iterations and
//! decides when the run should escalate and when it should give up. The
//! `StallMonitor` watches tasks that stay queued across iterations, which is
//! how a dependency cycle or a prerequisite that never arrives shows up.
//!
//! ## Escalation
//!
//! After `window` consecutive iterations without a new best score the
//! tracker asks for one escalation. If the next `window` iterations do not
//! improve either, the run is exhausted:
//! - `Improved` when the score beats the best so far
//! - `Stagnant` while the non-improving streak is shorter than the window
//! - `Escalate` the first time the window fills
//! - `Exhausted` when it fills again after escalation

use crate::core::task::TaskId;
use crate::orchestration::scheduler::PendingTask;
use crate::orchestration::worker::WorkerKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Minimum score gain that counts as improvement.
pub const IMPROVEMENT_EPSILON: f64 = 1e-6;

/// Default number of non-improving iterations before escalating.
pub const DEFAULT_STAGNATION_WINDOW: u32 = 3;

/// Default number of iterations a task may stay queued before it is reported.
pub const DEFAULT_STALL_ITERATIONS: u32 = 2;

/// What the tracker concluded from one iteration's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New best score.
    Improved,
    /// No improvement; `streak` consecutive iterations so far.
    Stagnant { streak: u32 },
    /// The window filled for the first time. Escalate before the next
    /// iteration.
    Escalate,
    /// The window filled again after escalation.
    Exhausted,
}

/// Tracks the best score and the non-improving streak.
///
/// # Example
///
/// ```
/// use mend::orchestration::{StagnationTracker, Verdict};
///
/// let mut tracker = StagnationTracker::new(2);
/// assert_eq!(tracker.observe(50.0), Verdict::Improved);
/// assert_eq!(tracker.observe(50.0), Verdict::Stagnant { streak: 1 });
/// assert_eq!(tracker.observe(40.0), Verdict::Escalate);
/// assert_eq!(tracker.best_score(), 50.0);
/// ```
#[derive(Debug, Clone)]
pub struct StagnationTracker {
    /// Non-improving iterations that trigger escalation.
    window: u32,
    /// Best score seen so far.
    best: Option<f64>,
    /// Current non-improving streak.
    streak: u32,
    /// Whether escalation already happened.
    escalated: bool,
}

impl StagnationTracker {
    /// Create a tracker.
    ///
    /// # Arguments
    ///
    /// * `window` - Consecutive non-improving iterations before escalating (at least 1)
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            best: None,
            streak: 0,
            escalated: false,
        }
    }

    /// Feed one iteration's overall score.
    ///
    /// # Returns
    ///
    /// The verdict for this iteration. The streak resets after `Escalate`
    /// so the post-escalation window starts fresh.
    pub fn observe(&mut self, score: f64) -> Verdict {
        let improved = match self.best {
            None => true,
            Some(best) => score > best + IMPROVEMENT_EPSILON,
        };
        if improved {
            self.best = Some(score);
            self.streak = 0;
            return Verdict::Improved;
        }

        self.streak += 1;
        if self.streak < self.window {
            return Verdict::Stagnant {
                streak: self.streak,
            };
        }

        self.streak = 0;
        if self.escalated {
            Verdict::Exhausted
        } else {
            self.escalated = true;
            Verdict::Escalate
        }
    }

    /// Best score so far, 0 before any observation. Never decreases.
    pub fn best_score(&self) -> f64 {
        self.best.unwrap_or(0.0)
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn has_escalated(&self) -> bool {
        self.escalated
    }
}

impl Default for StagnationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STAGNATION_WINDOW)
    }
}

/// Record of an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Iteration after which the escalation was applied.
    pub iteration: u32,
    /// The weakest validator's worker.
    pub worker: WorkerKind,
    /// Lanes added to that worker.
    pub extra_lanes: usize,
    /// Pool capacity after escalation.
    pub pool_capacity: usize,
    pub at: DateTime<Utc>,
}

/// A task that has stayed queued too long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalledTask {
    pub id: TaskId,
    pub label: String,
    /// Unfinished prerequisites. Empty when the task was ready but never
    /// dispatched.
    pub waiting_on: Vec<TaskId>,
    /// Iteration in which the task was first seen queued.
    pub pending_since: u32,
    /// Whether the task sits on a dependency cycle.
    pub in_cycle: bool,
}

/// Result of one stall check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StallCheck {
    /// Every task currently over the threshold, sorted by id.
    pub stalled: Vec<StalledTask>,
    /// Ids crossing the threshold in this check.
    pub newly_stalled: Vec<TaskId>,
}

/// Flags tasks that stay queued across iterations.
///
/// A dependency cycle or a prerequisite that never completes is not an
/// error in the scheduler; it only shows up as a task that never leaves the
/// queue. The monitor turns that into a diagnostic.
#[derive(Debug, Clone)]
pub struct StallMonitor {
    /// Iterations a task may stay queued before it is reported.
    threshold: u32,
    /// Task id to the iteration it was first seen queued.
    first_seen: HashMap<TaskId, u32>,
    /// Ids already reported.
    reported: HashSet<TaskId>,
}

impl StallMonitor {
    /// Create a monitor.
    ///
    /// # Arguments
    ///
    /// * `threshold` - Iterations a task may stay queued before being reported (at least 1)
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            first_seen: HashMap::new(),
            reported: HashSet::new(),
        }
    }

    /// Check the queue at the end of an iteration.
    ///
    /// # Arguments
    ///
    /// * `iteration` - The iteration that just ran (1-based)
    /// * `pending` - Tasks still queued in the scheduler
    /// * `cycles` - Dependency cycles among them
    ///
    /// # Returns
    ///
    /// The stalled tasks and which of them crossed the threshold now.
    pub fn observe(&mut self, iteration: u32, pending: &[PendingTask], cycles: &[Vec<TaskId>]) -> StallCheck {
        let on_cycle: HashSet<TaskId> = cycles.iter().flatten().copied().collect();
        let queued: HashSet<TaskId> = pending.iter().map(|p| p.id).collect();
        // Work behind other queued work (a capped backlog) is not stuck.
        let stuck: HashSet<TaskId> = pending
            .iter()
            .filter(|p| on_cycle.contains(&p.id) || p.waiting_on.iter().any(|w| !queued.contains(w)))
            .map(|p| p.id)
            .collect();
        self.first_seen.retain(|id, _| stuck.contains(id));
        self.reported.retain(|id| stuck.contains(id));

        let mut check = StallCheck::default();
        for task in pending.iter().filter(|p| stuck.contains(&p.id)) {
            let since = *self.first_seen.entry(task.id).or_insert(iteration);
            let age = iteration.saturating_sub(since) + 1;
            if age < self.threshold {
                continue;
            }
            if self.reported.insert(task.id) {
                check.newly_stalled.push(task.id);
            }
            check.stalled.push(StalledTask {
                id: task.id,
                label: task.label.clone(),
                waiting_on: task.waiting_on.clone(),
                pending_since: since,
                in_cycle: on_cycle.contains(&task.id),
            });
        }
        check.stalled.sort_by_key(|t| t.id);
        check.newly_stalled.sort();
        check
    }

    /// Number of queued tasks being watched.
    pub fn watched(&self) -> usize {
        self.first_seen.len()
    }
}

impl Default for StallMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_ITERATIONS)
    }
}
