//! Capability-typed workers.
//!
//! A `Worker` runs the command variants of one task against the project and
//! turns the tool output into a scored [`TaskResult`]. There is exactly one
//! worker per [`WorkerKind`], and every [`TaskType`] belongs to exactly one
//! kind.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;

use crate::core::task::{Task, TaskResult, TaskType};
use crate::error::Result;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::util::fingerprint_file;
use crate::{mlog_debug, mlog_trace};

/// Number of durations kept per worker.
pub const DURATION_HISTORY: usize = 32;

/// Weight of the newest quality score in the rolling success score.
const SUCCESS_SMOOTHING: f64 = 0.2;

/// Slack added to a task's time budget on top of its command timeouts.
const TASK_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_ERROR_PATTERN: &str = r"(?i)\berror\b";
pub const DEFAULT_WARNING_PATTERN: &str = r"(?i)\bwarning\b";

/// The closed set of worker capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Syntax,
    Type,
    Lint,
    Format,
    Build,
    Security,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::Syntax,
        WorkerKind::Type,
        WorkerKind::Lint,
        WorkerKind::Format,
        WorkerKind::Build,
        WorkerKind::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Syntax => "syntax",
            WorkerKind::Type => "type",
            WorkerKind::Lint => "lint",
            WorkerKind::Format => "format",
            WorkerKind::Build => "build",
            WorkerKind::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// The worker responsible for a task type.
    pub fn for_task(task_type: TaskType) -> Self {
        match task_type {
            TaskType::FixSyntax => WorkerKind::Syntax,
            TaskType::FixTypes | TaskType::TypeCheck => WorkerKind::Type,
            TaskType::FixLint | TaskType::LintCheck => WorkerKind::Lint,
            TaskType::Format | TaskType::FormatCheck => WorkerKind::Format,
            TaskType::Setup | TaskType::BuildCheck => WorkerKind::Build,
            TaskType::SecurityAudit => WorkerKind::Security,
        }
    }

    pub fn accepts(&self, task_type: TaskType) -> bool {
        Self::for_task(task_type) == *self
    }

    /// Score deducted per error. A warning costs a quarter of this.
    pub fn error_penalty(&self) -> f64 {
        match self {
            WorkerKind::Syntax => 20.0,
            WorkerKind::Type => 5.0,
            WorkerKind::Lint => 2.0,
            WorkerKind::Format => 10.0,
            WorkerKind::Security => 15.0,
            // Build is all-or-nothing.
            WorkerKind::Build => 100.0,
        }
    }

    /// Quality score in `0..=100` for one attempt.
    pub fn score(&self, success: bool, errors: usize, warnings: usize) -> f64 {
        if success && errors == 0 && warnings == 0 {
            return 100.0;
        }
        if *self == WorkerKind::Build {
            return if success && errors == 0 { 100.0 } else { 0.0 };
        }
        let penalty = self.error_penalty();
        (100.0 - penalty * errors as f64 - penalty / 4.0 * warnings as f64).max(0.0)
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker picks its command variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// The task's own variants, in order.
    Standard,
    /// The kind's escalation variants first, then the task's.
    Escalated,
}

/// Summary lines that report nothing wrong, e.g. `Found 0 errors`.
static ZERO_SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(0|no) (errors?|warnings?|problems?)\b").unwrap());

static DEFAULT_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(DEFAULT_ERROR_PATTERN).unwrap());
static DEFAULT_WARNING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_WARNING_PATTERN).unwrap());

/// Line classifiers for one worker kind.
#[derive(Debug, Clone)]
pub struct OutputPatterns {
    error: Regex,
    warning: Regex,
}

impl OutputPatterns {
    pub fn new(error: &str, warning: &str) -> Result<Self> {
        Ok(Self {
            error: Regex::new(error)?,
            warning: Regex::new(warning)?,
        })
    }

    /// Split tool output into error and warning lines.
    ///
    /// Summary lines reporting zero problems are ignored. A failed command
    /// with no recognisable error line still yields one error.
    pub fn classify(&self, output: &CommandOutput, program: &str) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for line in output.stdout.lines().chain(output.stderr.lines()) {
            let line = line.trim();
            if line.is_empty() || ZERO_SUMMARY_RE.is_match(line) {
                continue;
            }
            if self.error.is_match(line) {
                errors.push(line.to_string());
            } else if self.warning.is_match(line) {
                warnings.push(line.to_string());
            }
        }

        if !output.succeeded && errors.is_empty() {
            let synthetic = output
                .stderr
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} exited unsuccessfully", program));
            errors.push(synthetic);
        }
        (errors, warnings)
    }
}

impl Default for OutputPatterns {
    fn default() -> Self {
        Self {
            error: DEFAULT_ERROR_RE.clone(),
            warning: DEFAULT_WARNING_RE.clone(),
        }
    }
}

/// Running statistics for one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    /// Rolling quality, starts at 100.
    pub success_score: f64,
    #[serde(skip)]
    pub durations: VecDeque<Duration>,
}

impl WorkerStats {
    fn record(&mut self, result: &TaskResult) {
        self.processed += 1;
        if result.success {
            self.succeeded += 1;
        }
        self.success_score =
            (1.0 - SUCCESS_SMOOTHING) * self.success_score + SUCCESS_SMOOTHING * result.quality_score;
        if self.durations.len() == DURATION_HISTORY {
            self.durations.pop_front();
        }
        self.durations.push_back(result.duration);
    }

    pub fn average_duration(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let total: Duration = self.durations.iter().sum();
        Some(total / self.durations.len() as u32)
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            success_score: 100.0,
            durations: VecDeque::with_capacity(DURATION_HISTORY),
        }
    }
}

struct Attempt {
    output: CommandOutput,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Attempt {
    /// Lower is better: fewest errors, then success, then fewest warnings.
    fn rank(&self) -> (usize, bool, usize) {
        (self.errors.len(), !self.output.succeeded, self.warnings.len())
    }

    fn is_clean(&self) -> bool {
        self.output.succeeded && self.errors.is_empty() && self.warnings.is_empty()
    }
}

/// One capability unit.
pub struct Worker {
    kind: WorkerKind,
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    command_timeout: Duration,
    patterns: OutputPatterns,
    escalation: Vec<CommandSpec>,
    escalated: AtomicBool,
    lanes: Arc<Semaphore>,
    lane_count: AtomicUsize,
    stats: RwLock<WorkerStats>,
}

impl Worker {
    /// Create a worker.
    ///
    /// # Arguments
    ///
    /// * `kind` - The capability this worker provides
    /// * `runner` - Executes the external commands
    /// * `root` - Project root; commands run there and targets resolve against it
    /// * `lanes` - Maximum number of tasks this worker runs at once
    pub fn new(kind: WorkerKind, runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>, lanes: usize) -> Self {
        let lanes = lanes.max(1);
        Self {
            kind,
            runner,
            root: root.into(),
            command_timeout: Duration::from_secs(300),
            patterns: OutputPatterns::default(),
            escalation: Vec::new(),
            escalated: AtomicBool::new(false),
            lanes: Arc::new(Semaphore::new(lanes)),
            lane_count: AtomicUsize::new(lanes),
            stats: RwLock::new(WorkerStats::default()),
        }
    }

    pub fn with_patterns(mut self, patterns: OutputPatterns) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_escalation(mut self, variants: Vec<CommandSpec>) -> Self {
        self.escalation = variants;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn strategy(&self) -> Strategy {
        if self.escalated.load(Ordering::SeqCst) {
            Strategy::Escalated
        } else {
            Strategy::Standard
        }
    }

    /// Switch to the escalated strategy. Returns false if already escalated.
    pub fn escalate(&self) -> bool {
        !self.escalated.swap(true, Ordering::SeqCst)
    }

    pub fn lanes(&self) -> usize {
        self.lane_count.load(Ordering::SeqCst)
    }

    /// Allow `extra` more concurrent tasks.
    pub fn widen(&self, extra: usize) {
        self.lanes.add_permits(extra);
        self.lane_count.fetch_add(extra, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    fn variants(&self, task: &Task) -> Vec<CommandSpec> {
        match self.strategy() {
            Strategy::Standard => task.command.clone(),
            Strategy::Escalated => self
                .escalation
                .iter()
                .chain(task.command.iter())
                .cloned()
                .collect(),
        }
    }

    /// Upper bound on how long `process` may take for `task`.
    pub fn time_budget(&self, task: &Task) -> Duration {
        let commands: Duration = self
            .variants(task)
            .iter()
            .map(|spec| spec.timeout_secs.map(Duration::from_secs).unwrap_or(self.command_timeout))
            .sum();
        commands + TASK_GRACE
    }

    fn resolve(&self, target: &Path) -> PathBuf {
        self.root.join(target)
    }

    /// Run the task's variants and return the best attempt as a result.
    pub async fn process(&self, task: &Task) -> TaskResult {
        let started = Instant::now();
        if !self.kind.accepts(task.task_type) {
            return TaskResult::failed(
                task,
                format!("{} worker does not accept {} tasks", self.kind, task.task_type),
                started.elapsed(),
            );
        }
        let variants = self.variants(task);
        if variants.is_empty() {
            return TaskResult::failed(
                task,
                format!("no command configured for {}", task.task_type),
                started.elapsed(),
            );
        }

        let _lane = match self.lanes.acquire().await {
            Ok(permit) => permit,
            Err(_) => return TaskResult::failed(task, "worker lanes closed", started.elapsed()),
        };

        let target_path = task.target.as_deref().map(|t| self.resolve(t));
        let before = match &target_path {
            Some(path) => fingerprint_file(path).await,
            None => None,
        };

        let mut best: Option<Attempt> = None;
        let mut attempts = 0u32;
        for spec in &variants {
            attempts += 1;
            let invocation = spec.invocation(task.target.as_deref(), &self.root, self.command_timeout);
            let output = self.runner.execute(&invocation).await;
            let (errors, warnings) = self.patterns.classify(&output, &spec.program);
            let attempt = Attempt {
                output,
                errors,
                warnings,
            };
            mlog_trace!(
                "{} worker: task {} variant {} -> errors={} warnings={}",
                self.kind,
                task.id,
                attempts,
                attempt.errors.len(),
                attempt.warnings.len()
            );

            let clean = attempt.is_clean();
            if best.as_ref().map_or(true, |b| attempt.rank() < b.rank()) {
                best = Some(attempt);
            }
            if clean {
                break;
            }
        }
        let Some(best) = best else {
            return TaskResult::failed(task, "no attempt made", started.elapsed());
        };

        let after = match &target_path {
            Some(path) => fingerprint_file(path).await,
            None => None,
        };

        let mut metrics = BTreeMap::new();
        metrics.insert("attempts".to_string(), f64::from(attempts));
        if let Some(code) = best.output.exit_code {
            metrics.insert("exit_code".to_string(), f64::from(code));
        }
        if best.output.timed_out {
            metrics.insert("timed_out".to_string(), 1.0);
        }
        let changed = match (&before, &after) {
            (Some((old, old_lines)), Some((new, new_lines))) => {
                metrics.insert("lines_delta".to_string(), *new_lines as f64 - *old_lines as f64);
                Some(old != new)
            }
            _ => None,
        };

        let quality_score = self
            .kind
            .score(best.output.succeeded, best.errors.len(), best.warnings.len());
        let result = TaskResult {
            task_id: task.id,
            task_type: task.task_type,
            target: task.target.clone(),
            success: best.output.succeeded,
            output: best.output.combined(),
            errors: best.errors,
            warnings: best.warnings,
            metrics,
            duration: started.elapsed(),
            quality_score,
            changed,
            fingerprint: after.map(|(hash, _)| hash),
        };

        self.stats.write().await.record(&result);
        mlog_debug!(
            "{} worker: {} done success={} score={:.1} changed={:?}",
            self.kind,
            task.label(),
            result.success,
            result.quality_score,
            result.changed
        );
        result
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("kind", &self.kind)
            .field("strategy", &self.strategy())
            .field("lanes", &self.lanes())
            .finish()
    }
}
