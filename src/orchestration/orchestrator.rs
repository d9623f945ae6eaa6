//! The convergence loop.
//!
//! Each iteration discovers targets, plans a fix chain per target, drains
//! the scheduler through the worker pool, runs the project-wide validators
//! and scores the result. The loop stops when the project converges, when
//! escalation stops helping, or when a budget runs out.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::task::{Priority, Task, TaskId, TaskResult, TaskType};
use crate::error::{Error, Result};
use crate::orchestration::discovery::{discover, Target};
use crate::orchestration::health::{Escalation, StagnationTracker, StallMonitor, StalledTask, Verdict};
use crate::orchestration::pool::WorkerPool;
use crate::orchestration::scheduler::Scheduler;
use crate::orchestration::worker::WorkerKind;
use crate::report::{IterationRecord, RunOutcome, RunReport, ValidatorReport};
use crate::runner::{CommandRunner, ProcessRunner};
use crate::state::StateDir;
use crate::util::blocking;
use crate::{mlog, mlog_debug, mlog_warn};

/// Immutable facts about one run, shared by everything that needs them.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub root: PathBuf,
    pub config: Config,
    pub state_dir: PathBuf,
    pub run_id: Uuid,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        let root = root.into();
        let state_dir = config.state_dir(&root);
        Self {
            root,
            config,
            state_dir,
            run_id: Uuid::new_v4(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn budget_exhausted(&self) -> bool {
        self.elapsed() >= self.config.run.wall_clock()
    }
}

/// Progress notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    IterationStarted {
        index: u32,
    },
    TaskStarted {
        id: TaskId,
        label: String,
    },
    TaskFinished {
        id: TaskId,
        label: String,
        success: bool,
        score: f64,
    },
    IterationFinished {
        index: u32,
        score: f64,
        best_score: f64,
        converged: bool,
    },
    Escalated {
        iteration: u32,
        worker: WorkerKind,
        pool_capacity: usize,
    },
    Stalled {
        tasks: Vec<StalledTask>,
    },
}

/// Fix-task outcomes for one planned target.
#[derive(Debug, Clone)]
struct TargetProgress {
    clean: bool,
    fingerprint: Option<String>,
}

/// Which tasks a drain may dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Setup and fix chains, capped at `max_batches_per_phase`.
    Fix,
    /// Project-wide validators only. Runs until every validator is done.
    Validation,
}

impl Phase {
    fn admits(self, task: &Task) -> bool {
        task.task_type.is_validation() == (self == Phase::Validation)
    }
}

/// What a drained phase produced.
#[derive(Debug, Default)]
struct PhaseOutcome {
    dispatched: usize,
    validators: Vec<TaskResult>,
    halted: Option<RunOutcome>,
}

/// Drives the fix → scan → verify loop.
pub struct Orchestrator {
    ctx: Arc<RunContext>,
    scheduler: Scheduler,
    pool: WorkerPool,
    stagnation: StagnationTracker,
    stalls: StallMonitor,
    state: Option<StateDir>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    cancel: CancellationToken,
    check_tools: bool,
    setup_ids: Vec<TaskId>,
    /// Planned targets whose fix tasks are still being tracked.
    progress: HashMap<PathBuf, TargetProgress>,
    /// Targets whose fixes came back clean, with their fingerprint then.
    settled: HashMap<PathBuf, String>,
    changed: HashSet<PathBuf>,
    iterations: Vec<IterationRecord>,
    escalations: Vec<Escalation>,
    stalled: Vec<StalledTask>,
    missing_tools: Vec<String>,
}

impl Orchestrator {
    /// Create an orchestrator for one run.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Root, configuration and run identity
    /// * `runner` - Executes every external command
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(ctx: RunContext, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        ctx.config.validate()?;
        let pool = WorkerPool::from_config(&ctx.config, &ctx.root, runner)?;
        let run = &ctx.config.run;
        Ok(Self {
            stagnation: StagnationTracker::new(run.stagnation_window),
            stalls: StallMonitor::new(run.stall_iterations),
            ctx: Arc::new(ctx),
            scheduler: Scheduler::new(),
            pool,
            state: None,
            event_tx: None,
            cancel: CancellationToken::new(),
            check_tools: false,
            setup_ids: Vec::new(),
            progress: HashMap::new(),
            settled: HashMap::new(),
            changed: HashSet::new(),
            iterations: Vec::new(),
            escalations: Vec::new(),
            stalled: Vec::new(),
            missing_tools: Vec::new(),
        })
    }

    /// Persist history and duration samples in the context's state
    /// directory. Call before submitting tasks: the scheduler is rebuilt
    /// around the stored estimator.
    pub fn with_state(mut self) -> Result<Self> {
        let state = StateDir::open(&self.ctx.state_dir)?;
        self.scheduler = Scheduler::with_estimator(state.durations().load());
        self.state = Some(state);
        Ok(self)
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<RunEvent>) -> Self {
        self.pool.set_event_sender(event_tx.clone());
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Warn about configured programs missing from `PATH` before the run.
    pub fn with_tool_check(mut self) -> Self {
        self.check_tools = true;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Queue an extra task alongside the planned ones.
    pub fn submit(&mut self, task: Task) -> Result<TaskId> {
        self.scheduler.add(task)
    }

    /// Reserve an id for a task submitted later.
    pub fn reserve_id(&mut self) -> TaskId {
        self.scheduler.reserve_id()
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    fn halt_reason(&self) -> Option<RunOutcome> {
        if self.cancel.is_cancelled() {
            Some(RunOutcome::Interrupted)
        } else if self.ctx.budget_exhausted() {
            Some(RunOutcome::BudgetExhausted)
        } else {
            None
        }
    }

    fn ensure_root(&self) -> Result<()> {
        if self.ctx.root.is_dir() {
            Ok(())
        } else {
            Err(Error::RootMissing(self.ctx.root.clone()))
        }
    }

    fn find_missing_tools(&mut self) {
        self.missing_tools = self
            .ctx
            .config
            .tools
            .programs()
            .into_iter()
            .filter(|program| !ProcessRunner::is_available(program))
            .map(str::to_string)
            .collect();
        for program in &self.missing_tools {
            mlog_warn!("tool not found on PATH: {}", program);
        }
    }

    /// Run until convergence, stagnation or a budget runs out.
    ///
    /// # Errors
    ///
    /// Only unexpected conditions abort the run: the project root vanishing,
    /// the state directory becoming unwritable, or a scheduler invariant
    /// breaking. Tool failures are part of the report.
    pub async fn run(&mut self) -> Result<RunReport> {
        let ctx = Arc::clone(&self.ctx);
        let run = &ctx.config.run;
        mlog!(
            "run {} starting on {} (threshold={}, max_iterations={}, pool={})",
            ctx.run_id,
            ctx.root.display(),
            run.threshold,
            run.max_iterations,
            self.pool.capacity()
        );
        if self.check_tools {
            self.find_missing_tools();
        }

        let outcome = loop {
            if let Some(halt) = self.halt_reason() {
                break halt;
            }
            let index = self.iterations.len() as u32 + 1;
            if index > run.max_iterations {
                break RunOutcome::ConvergenceFailure;
            }
            self.ensure_root()?;

            match self.iterate(index).await? {
                Some(outcome) => break outcome,
                None => continue,
            }
        };

        self.finish(outcome)
    }

    /// One pass. Returns the outcome when the run should stop.
    async fn iterate(&mut self, index: u32) -> Result<Option<RunOutcome>> {
        let ctx = Arc::clone(&self.ctx);
        let run = &ctx.config.run;
        let started = Instant::now();
        self.emit(RunEvent::IterationStarted { index });
        mlog_debug!("iteration {} starting", index);
        self.changed.clear();

        let targets = {
            let root = ctx.root.clone();
            let discovery = ctx.config.discovery.clone();
            blocking(move || discover(&root, &discovery)).await?
        };
        let planned = self.plan(index, &targets)?;
        mlog_debug!("iteration {}: {} targets, {} tasks planned", index, targets.len(), planned);

        let fix = self.drain(Phase::Fix).await?;
        if let Some(halt) = fix.halted {
            return Ok(Some(halt));
        }
        self.settle();

        self.queue_validators()?;
        let validation = self.drain(Phase::Validation).await?;
        if let Some(halt) = validation.halted {
            return Ok(Some(halt));
        }
        self.check_stalls(index);

        let mut validators: Vec<ValidatorReport> = validation
            .validators
            .iter()
            .map(ValidatorReport::from_result)
            .collect();
        for task_type in ctx.config.tools.validators() {
            if !validators.iter().any(|v| v.task_type == task_type) {
                mlog_warn!("iteration {}: {} produced no result", index, task_type);
                validators.push(ValidatorReport::missing(task_type));
            }
        }
        validators.sort_by_key(|v| v.task_type);

        let score = overall_score(&validators);
        let errors: usize = validators.iter().map(|v| v.errors).sum();
        let warnings: usize = validators.iter().map(|v| v.warnings).sum();
        let converged = score >= run.threshold && validators.iter().all(|v| v.errors == 0);

        let verdict = if converged {
            None
        } else {
            Some(self.stagnation.observe(score))
        };
        let best_score = self.stagnation.best_score().max(score);

        let mut escalated = None;
        if verdict == Some(Verdict::Escalate) {
            escalated = self.escalate(index, &validators);
        }

        let record = IterationRecord {
            index,
            tasks_dispatched: fix.dispatched + validation.dispatched,
            errors,
            warnings,
            score,
            best_score,
            duration_secs: started.elapsed().as_secs_f64(),
            converged,
            escalated,
            changed_targets: self.changed.len(),
            validators,
        };
        if let Some(state) = &self.state {
            state.history().append(ctx.run_id, &record)?;
        }
        mlog!(
            "iteration {}: score {:.1} (best {:.1}), {} errors, {} warnings, {} tasks",
            index,
            score,
            best_score,
            errors,
            warnings,
            record.tasks_dispatched
        );
        self.emit(RunEvent::IterationFinished {
            index,
            score,
            best_score,
            converged,
        });
        self.iterations.push(record);

        Ok(match verdict {
            None => Some(RunOutcome::Converged),
            Some(Verdict::Exhausted) => Some(RunOutcome::Stagnated),
            Some(_) => None,
        })
    }

    /// Queue setup (first iteration only) and the fix chain per target.
    fn plan(&mut self, index: u32, targets: &[Target]) -> Result<usize> {
        let ctx = Arc::clone(&self.ctx);
        let tools = &ctx.config.tools;
        let mut planned = 0;

        if index == 1 {
            for spec in tools.commands(TaskType::Setup) {
                let task = Task::new(TaskType::Setup, Priority::Critical).with_command(spec.clone());
                self.setup_ids.push(self.scheduler.add(task)?);
                planned += 1;
            }
        }

        let threshold = ctx.config.discovery.complexity_threshold;
        for target in targets {
            if self.scheduler.has_work_for(&target.path) {
                continue;
            }
            if self.settled.get(&target.path) == Some(&target.fingerprint) {
                continue;
            }

            let priority = target.priority(threshold);
            let mut previous: Option<TaskId> = None;
            for task_type in TaskType::FIX_CHAIN {
                if task_type == TaskType::FixSyntax && !target.suspect_syntax {
                    continue;
                }
                let commands = tools.commands(task_type);
                if commands.is_empty() {
                    continue;
                }
                let mut task = Task::new(task_type, priority)
                    .with_target(&target.path)
                    .with_commands(commands.iter().cloned())
                    .with_complexity(target.complexity);
                for &setup in &self.setup_ids {
                    task = task.depends_on(setup);
                }
                if let Some(prev) = previous {
                    task = task.depends_on(prev);
                }
                previous = Some(self.scheduler.add(task)?);
                planned += 1;
            }

            if previous.is_some() {
                self.progress.insert(
                    target.path.clone(),
                    TargetProgress {
                        clean: true,
                        fingerprint: None,
                    },
                );
            }
        }
        Ok(planned)
    }

    fn queue_validators(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        for task_type in ctx.config.tools.validators() {
            let task = Task::new(task_type, Priority::Normal)
                .with_commands(ctx.config.tools.commands(task_type).iter().cloned());
            self.scheduler.add(task)?;
        }
        Ok(())
    }

    /// Dispatch the phase's batches until none is ready or a limit hits.
    ///
    /// Tasks the phase does not admit stay queued; fix work cut off by the
    /// batch cap carries over to the next iteration.
    async fn drain(&mut self, phase: Phase) -> Result<PhaseOutcome> {
        let ctx = Arc::clone(&self.ctx);
        let run = &ctx.config.run;
        let mut outcome = PhaseOutcome::default();
        let mut batches = 0;

        loop {
            if let Some(halt) = self.halt_reason() {
                outcome.halted = Some(halt);
                break;
            }
            if phase == Phase::Fix && batches >= run.max_batches_per_phase {
                mlog_warn!(
                    "fix phase stopped after {} batches with {} tasks queued",
                    batches,
                    self.scheduler.queued_count()
                );
                break;
            }
            let batch = self
                .scheduler
                .get_ready_where(self.pool.capacity(), run.batch_budget(), |task| phase.admits(task));
            if batch.is_empty() {
                break;
            }
            batches += 1;
            outcome.dispatched += batch.len();
            mlog_debug!("dispatching batch {} of {} tasks", batches, batch.len());

            let results = self.pool.dispatch(&batch).await;
            for (task, result) in batch.into_iter().zip(results) {
                let retry = if !result.success && task.task_type.is_retryable() {
                    task.next_attempt(run.max_retries)
                } else {
                    None
                };
                match retry {
                    Some(retry) => {
                        mlog_debug!("retrying {} (attempt {})", task.label(), retry.retry_count + 1);
                        self.scheduler.retry(task.id, result.duration, retry)?;
                    }
                    None => self.scheduler.mark_completed(task.id, result.duration, result.success)?,
                }
                self.absorb(result, &mut outcome);
            }
        }
        Ok(outcome)
    }

    fn absorb(&mut self, result: TaskResult, outcome: &mut PhaseOutcome) {
        if result.task_type.is_validation() {
            outcome.validators.push(result);
            return;
        }
        let Some(target) = &result.target else {
            return;
        };
        if result.changed == Some(true) {
            self.changed.insert(target.clone());
        }
        if let Some(progress) = self.progress.get_mut(target) {
            progress.clean &= result.is_clean();
            if result.fingerprint.is_some() {
                progress.fingerprint = result.fingerprint.clone();
            }
        }
    }

    /// Settle targets whose fix chain finished.
    fn settle(&mut self) {
        let scheduler = &self.scheduler;
        let settled = &mut self.settled;
        self.progress.retain(|path, progress| {
            if scheduler.has_work_for(path) {
                return true;
            }
            match (&progress.fingerprint, progress.clean) {
                (Some(fingerprint), true) => {
                    settled.insert(path.clone(), fingerprint.clone());
                }
                _ => {
                    settled.remove(path);
                }
            }
            false
        });
    }

    fn check_stalls(&mut self, index: u32) {
        let pending = self.scheduler.pending();
        let cycles = self.scheduler.cycles();
        let check = self.stalls.observe(index, &pending, &cycles);
        if !check.newly_stalled.is_empty() {
            for task in check.stalled.iter().filter(|t| check.newly_stalled.contains(&t.id)) {
                mlog_warn!(
                    "task {} ({}) pending since iteration {}, waiting on {:?}{}",
                    task.id,
                    task.label,
                    task.pending_since,
                    task.waiting_on,
                    if task.in_cycle { " (dependency cycle)" } else { "" }
                );
            }
            self.emit(RunEvent::Stalled {
                tasks: check.stalled.clone(),
            });
        }
        self.stalled = check.stalled;
    }

    /// Widen the weakest validator's worker and switch its strategy.
    fn escalate(&mut self, index: u32, validators: &[ValidatorReport]) -> Option<WorkerKind> {
        let weakest = validators
            .iter()
            .min_by(|a, b| a.score.total_cmp(&b.score))?
            .worker();
        let extra = self.ctx.config.run.escalation_extra_workers;
        let pool_capacity = self.pool.widen(weakest, extra);
        if let Some(worker) = self.pool.worker(weakest) {
            worker.escalate();
        }
        mlog_warn!(
            "score stagnated; escalating {} worker (+{} lanes, pool {})",
            weakest,
            extra,
            pool_capacity
        );
        self.escalations.push(Escalation {
            iteration: index,
            worker: weakest,
            extra_lanes: extra,
            pool_capacity,
            at: Utc::now(),
        });
        self.emit(RunEvent::Escalated {
            iteration: index,
            worker: weakest,
            pool_capacity,
        });
        Some(weakest)
    }

    fn finish(&mut self, outcome: RunOutcome) -> Result<RunReport> {
        if let Some(state) = &self.state {
            state.durations().save(self.scheduler.estimator())?;
        }

        let validators = self
            .iterations
            .last()
            .map(|it| it.validators.clone())
            .unwrap_or_default();
        let remaining_errors = if outcome.is_success() {
            Vec::new()
        } else {
            validators
                .iter()
                .flat_map(|v| v.error_lines.iter().map(move |line| format!("{}: {}", v.task_type, line)))
                .collect()
        };

        mlog!(
            "run {} finished: {} after {} iteration(s)",
            self.ctx.run_id,
            outcome,
            self.iterations.len()
        );
        Ok(RunReport {
            run_id: self.ctx.run_id,
            root: self.ctx.root.clone(),
            outcome,
            started_at: self.ctx.started_at,
            finished_at: Utc::now(),
            final_score: self.iterations.last().map(|it| it.score).unwrap_or(0.0),
            best_score: self.stagnation.best_score().max(
                self.iterations.iter().map(|it| it.score).fold(0.0, f64::max),
            ),
            iterations: self.iterations.clone(),
            validators,
            remaining_errors,
            pending: self.stalled.clone(),
            escalations: self.escalations.clone(),
            missing_tools: self.missing_tools.clone(),
        })
    }
}

/// Mean validator score, or 100 when nothing is validated.
pub fn overall_score(validators: &[ValidatorReport]) -> f64 {
    if validators.is_empty() {
        return 100.0;
    }
    validators.iter().map(|v| v.score).sum::<f64>() / validators.len() as f64
}

/// Convenience for a one-shot run with the process runner.
///
/// The event channel closes when the run returns.
pub async fn run_project(
    root: &Path,
    config: Config,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<RunEvent>>,
) -> Result<RunReport> {
    let ctx = RunContext::new(root, config);
    let runner = ProcessRunner::new().with_max_output(ctx.config.run.max_output_bytes);
    let mut orchestrator = Orchestrator::new(ctx, Arc::new(runner))?
        .with_state()?
        .with_cancellation(cancel)
        .with_tool_check();
    if let Some(events) = events {
        orchestrator = orchestrator.with_events(events);
    }
    orchestrator.run().await
}
