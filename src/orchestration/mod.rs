//! Orchestration layer for mend.
//!
//! This module holds the pieces the convergence loop is built from: the
//! dependency-aware scheduler and its duration estimator, the capability
//! typed workers and the pool that dispatches batches to them, target
//! discovery, and the health checks that decide when to escalate or stop.

pub mod discovery;
pub mod estimator;
pub mod health;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod worker;

pub use discovery::{discover, profile, Profile, Target};
pub use estimator::{DurationEntry, DurationEstimator};
pub use health::{Escalation, StallCheck, StallMonitor, StalledTask, StagnationTracker, Verdict};
pub use orchestrator::{overall_score, run_project, Orchestrator, RunContext, RunEvent};
pub use pool::WorkerPool;
pub use scheduler::{CompletedTask, PendingTask, Scheduler};
pub use worker::{OutputPatterns, Strategy, Worker, WorkerKind, WorkerStats};
