//! Adaptive duration estimates per task class.
//!
//! Each `(task_type, priority)` class keeps an exponentially weighted rolling
//! average of observed durations. The scheduler uses it to replace the
//! static estimate of newly added tasks, which biases batch packing toward
//! reality. Nothing correctness-critical depends on it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::task::{Priority, Task, TaskType};

/// Weight given to the newest sample.
pub const DEFAULT_SMOOTHING: f64 = 0.3;

/// Persisted averages above this are discarded as corrupt (one week).
pub const MAX_AVERAGE_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// One persisted class average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationEntry {
    pub task_type: TaskType,
    pub priority: Priority,
    pub average_secs: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    average_secs: f64,
    samples: u64,
}

#[derive(Debug, Clone)]
pub struct DurationEstimator {
    smoothing: f64,
    classes: HashMap<(TaskType, Priority), Sample>,
}

impl DurationEstimator {
    pub fn new() -> Self {
        Self::with_smoothing(DEFAULT_SMOOTHING)
    }

    /// `smoothing` is clamped to `(0, 1]`.
    pub fn with_smoothing(smoothing: f64) -> Self {
        let smoothing = if smoothing.is_finite() {
            smoothing.clamp(f64::EPSILON, 1.0)
        } else {
            DEFAULT_SMOOTHING
        };
        Self {
            smoothing,
            classes: HashMap::new(),
        }
    }

    /// Rebuild from persisted entries.
    pub fn from_entries(entries: impl IntoIterator<Item = DurationEntry>) -> Self {
        let mut estimator = Self::new();
        for entry in entries {
            if (0.0..=MAX_AVERAGE_SECS).contains(&entry.average_secs) {
                estimator.classes.insert(
                    (entry.task_type, entry.priority),
                    Sample {
                        average_secs: entry.average_secs,
                        samples: entry.samples,
                    },
                );
            }
        }
        estimator
    }

    /// Fold one observed duration into its class.
    pub fn record(&mut self, task_type: TaskType, priority: Priority, duration: Duration) {
        let secs = duration.as_secs_f64();
        let smoothing = self.smoothing;
        self.classes
            .entry((task_type, priority))
            .and_modify(|sample| {
                sample.average_secs = (1.0 - smoothing) * sample.average_secs + smoothing * secs;
                sample.samples += 1;
            })
            .or_insert(Sample {
                average_secs: secs,
                samples: 1,
            });
    }

    pub fn estimate(&self, task_type: TaskType, priority: Priority) -> Option<Duration> {
        self.classes
            .get(&(task_type, priority))
            .and_then(|sample| Duration::try_from_secs_f64(sample.average_secs).ok())
    }

    /// Replace the task's estimate with the class average, if one exists.
    pub fn refine(&self, task: &mut Task) {
        if let Some(estimate) = self.estimate(task.task_type, task.priority) {
            task.estimated_duration = estimate;
        }
    }

    /// Persistable snapshot, sorted by class.
    pub fn entries(&self) -> Vec<DurationEntry> {
        let mut entries: Vec<DurationEntry> = self
            .classes
            .iter()
            .map(|(&(task_type, priority), sample)| DurationEntry {
                task_type,
                priority,
                average_secs: sample.average_secs,
                samples: sample.samples,
            })
            .collect();
        entries.sort_by(|a, b| (a.task_type, a.priority).cmp(&(b.task_type, b.priority)));
        entries
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for DurationEstimator {
    fn default() -> Self {
        Self::new()
    }
}
