//! Task data model for the scheduler.
//!
//! Tasks are the atomic units of work handed to workers: run a fixer against
//! one file, run a project-wide validator, or run one-time setup. Each attempt
//! produces exactly one [`TaskResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::runner::CommandSpec;

/// Identifier assigned by the scheduler when a task is inserted.
///
/// Ids increase monotonically within a run. `TaskId::UNASSIGNED` marks a task
/// that has not been inserted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    pub const UNASSIGNED: TaskId = TaskId(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task does. Closed set; each type maps to exactly one worker kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// One-time infrastructure work (config generation) before any fix.
    Setup,
    FixSyntax,
    FixTypes,
    FixLint,
    Format,
    TypeCheck,
    LintCheck,
    FormatCheck,
    BuildCheck,
    SecurityAudit,
}

impl TaskType {
    pub const ALL: [TaskType; 10] = [
        TaskType::Setup,
        TaskType::FixSyntax,
        TaskType::FixTypes,
        TaskType::FixLint,
        TaskType::Format,
        TaskType::TypeCheck,
        TaskType::LintCheck,
        TaskType::FormatCheck,
        TaskType::BuildCheck,
        TaskType::SecurityAudit,
    ];

    /// Per-target fix chain, in the order the fixes are applied to a file.
    pub const FIX_CHAIN: [TaskType; 4] = [
        TaskType::FixSyntax,
        TaskType::FixTypes,
        TaskType::FixLint,
        TaskType::Format,
    ];

    /// Whole-project validators run once per iteration.
    pub const VALIDATORS: [TaskType; 5] = [
        TaskType::TypeCheck,
        TaskType::LintCheck,
        TaskType::FormatCheck,
        TaskType::BuildCheck,
        TaskType::SecurityAudit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Setup => "setup",
            TaskType::FixSyntax => "fix_syntax",
            TaskType::FixTypes => "fix_types",
            TaskType::FixLint => "fix_lint",
            TaskType::Format => "format",
            TaskType::TypeCheck => "type_check",
            TaskType::LintCheck => "lint_check",
            TaskType::FormatCheck => "format_check",
            TaskType::BuildCheck => "build_check",
            TaskType::SecurityAudit => "security_audit",
        }
    }

    pub fn is_validation(&self) -> bool {
        Self::VALIDATORS.contains(self)
    }

    /// Fix and setup tasks may be retried; validators report, they don't retry.
    pub fn is_retryable(&self) -> bool {
        !self.is_validation()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority class. Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Where a task sits in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Inserted, waiting in the ready heap or behind a dependency.
    Queued,
    /// Handed out by `get_ready` and not yet reported back.
    Dispatched,
    /// Reported back; `success` is the outcome of the attempt.
    Completed { success: bool },
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Dispatched => write!(f, "dispatched"),
            TaskStatus::Completed { success: true } => write!(f, "completed"),
            TaskStatus::Completed { success: false } => write!(f, "failed"),
        }
    }
}

/// Default estimate used before the scheduler has seen a task class run.
pub const DEFAULT_ESTIMATE: Duration = Duration::from_secs(5);

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    /// File the task touches, relative to the project root. `None` for
    /// project-wide work.
    pub target: Option<PathBuf>,
    /// Command variants, tried in order by the worker.
    pub command: Vec<CommandSpec>,
    /// Ids that must be completed before this task may be dispatched.
    pub dependencies: BTreeSet<TaskId>,
    pub estimated_duration: Duration,
    pub complexity: u32,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: TaskType, priority: Priority) -> Self {
        Self {
            id: TaskId::UNASSIGNED,
            task_type,
            priority,
            target: None,
            command: Vec::new(),
            dependencies: BTreeSet::new(),
            estimated_duration: DEFAULT_ESTIMATE,
            complexity: 0,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command.push(command);
        self
    }

    pub fn with_commands(mut self, commands: impl IntoIterator<Item = CommandSpec>) -> Self {
        self.command.extend(commands);
        self
    }

    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    /// Short human label, e.g. `fix_lint src/app.ts`.
    pub fn label(&self) -> String {
        match &self.target {
            Some(target) => format!("{} {}", self.task_type, target.display()),
            None => self.task_type.to_string(),
        }
    }

    /// The retry of a failed attempt.
    ///
    /// Returns an uninserted copy with `retry_count + 1`, or `None` once the
    /// task has used up `max_retries`.
    pub fn next_attempt(&self, max_retries: u32) -> Option<Task> {
        if self.retry_count >= max_retries {
            return None;
        }
        let mut retry = self.clone();
        retry.id = TaskId::UNASSIGNED;
        retry.retry_count += 1;
        retry.created_at = Utc::now();
        Some(retry)
    }
}

/// Outcome of one attempt at a task. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub target: Option<PathBuf>,
    pub success: bool,
    pub output: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    pub duration: Duration,
    /// 0-100.
    pub quality_score: f64,
    /// Whether the target's content changed. `None` for untargeted tasks or
    /// unreadable targets.
    pub changed: Option<bool>,
    /// SHA-256 of the target after the attempt.
    pub fingerprint: Option<String>,
}

impl TaskResult {
    /// A failed result for a task that never reached a tool.
    pub fn failed(task: &Task, reason: impl Into<String>, duration: Duration) -> Self {
        let reason = reason.into();
        Self {
            task_id: task.id,
            task_type: task.task_type,
            target: task.target.clone(),
            success: false,
            output: String::new(),
            errors: vec![reason],
            warnings: Vec::new(),
            metrics: BTreeMap::new(),
            duration,
            quality_score: 0.0,
            changed: None,
            fingerprint: None,
        }
    }

    /// Clean means the tool succeeded with nothing left to report.
    pub fn is_clean(&self) -> bool {
        self.success && self.errors.is_empty() && self.warnings.is_empty()
    }
}
