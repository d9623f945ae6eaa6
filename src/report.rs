//! Run outcome and the final report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::core::task::{TaskResult, TaskType};
use crate::orchestration::health::{Escalation, StalledTask};
use crate::orchestration::worker::WorkerKind;
use crate::Result;

/// Error lines shown in the text report before eliding the rest.
const SHOWN_ERRORS: usize = 20;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Score reached the threshold and no validator reported errors.
    Converged,
    /// `max_iterations` ran out first.
    ConvergenceFailure,
    /// Escalation did not help either.
    Stagnated,
    /// The wall-clock budget ran out.
    BudgetExhausted,
    /// Cancelled from outside.
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Converged => 0,
            RunOutcome::ConvergenceFailure => 1,
            RunOutcome::Stagnated => 2,
            RunOutcome::BudgetExhausted => 3,
            RunOutcome::Interrupted => 130,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == RunOutcome::Converged
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Converged => "converged",
            RunOutcome::ConvergenceFailure => "convergence failure",
            RunOutcome::Stagnated => "stagnated",
            RunOutcome::BudgetExhausted => "budget exhausted",
            RunOutcome::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validator's verdict for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorReport {
    pub task_type: TaskType,
    pub passed: bool,
    pub errors: usize,
    pub warnings: usize,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_lines: Vec<String>,
}

impl ValidatorReport {
    pub fn from_result(result: &TaskResult) -> Self {
        Self {
            task_type: result.task_type,
            passed: result.success && result.errors.is_empty(),
            errors: result.errors.len(),
            warnings: result.warnings.len(),
            score: result.quality_score,
            error_lines: result.errors.clone(),
        }
    }

    /// A configured validator that produced no result this iteration.
    pub fn missing(task_type: TaskType) -> Self {
        Self {
            task_type,
            passed: false,
            errors: 1,
            warnings: 0,
            score: 0.0,
            error_lines: vec![format!("{} produced no result", task_type)],
        }
    }

    pub fn worker(&self) -> WorkerKind {
        WorkerKind::for_task(self.task_type)
    }
}

/// One pass of the convergence loop. Appended once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based.
    pub index: u32,
    pub tasks_dispatched: usize,
    /// Errors reported by validators.
    pub errors: usize,
    pub warnings: usize,
    pub score: f64,
    pub best_score: f64,
    pub duration_secs: f64,
    pub converged: bool,
    /// Worker escalated after this iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated: Option<WorkerKind>,
    /// Targets whose content changed during the fix phase.
    pub changed_targets: usize,
    pub validators: Vec<ValidatorReport>,
}

/// Everything a caller needs after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub root: PathBuf,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub iterations: Vec<IterationRecord>,
    pub final_score: f64,
    pub best_score: f64,
    /// Validators of the last iteration.
    pub validators: Vec<ValidatorReport>,
    /// Error lines left when the run did not converge.
    pub remaining_errors: Vec<String>,
    /// Tasks that stayed queued.
    pub pending: Vec<StalledTask>,
    pub escalations: Vec<Escalation>,
    /// Programs from the configuration that were not found on `PATH`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_tools: Vec<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Scores per iteration, in order.
    pub fn score_trend(&self) -> Vec<f64> {
        self.iterations.iter().map(|it| it.score).collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mend run {} on {}", self.run_id, self.root.display())?;
        writeln!(
            f,
            "outcome: {} after {} iteration(s), score {:.1} (best {:.1})",
            self.outcome,
            self.iterations.len(),
            self.final_score,
            self.best_score
        )?;

        if !self.iterations.is_empty() {
            let trend: Vec<String> = self.score_trend().iter().map(|s| format!("{:.1}", s)).collect();
            writeln!(f, "trend: {}", trend.join(" -> "))?;
        }

        if !self.validators.is_empty() {
            writeln!(f, "validators:")?;
            for v in &self.validators {
                writeln!(
                    f,
                    "  {:<15} {} errors={} warnings={} score={:.1}",
                    v.task_type.as_str(),
                    if v.passed { "pass" } else { "FAIL" },
                    v.errors,
                    v.warnings,
                    v.score
                )?;
            }
        }

        for e in &self.escalations {
            writeln!(
                f,
                "escalated {} worker after iteration {} (+{} lanes, pool {})",
                e.worker, e.iteration, e.extra_lanes, e.pool_capacity
            )?;
        }

        if !self.missing_tools.is_empty() {
            writeln!(f, "missing tools: {}", self.missing_tools.join(", "))?;
        }

        if !self.remaining_errors.is_empty() {
            writeln!(f, "remaining errors:")?;
            for line in self.remaining_errors.iter().take(SHOWN_ERRORS) {
                writeln!(f, "  {}", line)?;
            }
            if self.remaining_errors.len() > SHOWN_ERRORS {
                writeln!(f, "  ... and {} more", self.remaining_errors.len() - SHOWN_ERRORS)?;
            }
        }

        if !self.pending.is_empty() {
            writeln!(f, "stalled tasks:")?;
            for task in &self.pending {
                let waits: Vec<String> = task.waiting_on.iter().map(|id| id.to_string()).collect();
                write!(f, "  #{} {} pending since iteration {}", task.id, task.label, task.pending_since)?;
                if !waits.is_empty() {
                    write!(f, ", waiting on {}", waits.join(", "))?;
                }
                if task.in_cycle {
                    write!(f, " (dependency cycle)")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
