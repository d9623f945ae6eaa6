//! Parallel dispatch tests.
//!
//! These tests run on a paused tokio clock so durations are exact: the
//! scripted runner sleeps in virtual time and the assertions read it back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use mend::config::{Config, RunSettings};
use mend::core::{Priority, TaskType};
use mend::orchestration::{Orchestrator, RunContext, RunEvent, Scheduler, WorkerPool};
use mend::runner::CommandSpec;
use mend::RunOutcome;

use crate::fixtures::{fix_task, ScriptedRunner, TestProject};

fn lint_only_config(pool_size: usize) -> Config {
    let mut config = Config {
        run: RunSettings {
            pool_size: Some(pool_size),
            max_pool_size: pool_size,
            ..Default::default()
        },
        ..Default::default()
    };
    config
        .tools
        .commands_mut(TaskType::FixLint)
        .push(CommandSpec::new("eslint-fix", ["--fix", "{target}"]));
    config
}

/// Test: Bounded parallelism
/// Given 5 independent one-second fixes and a pool of 2
/// When the loop runs
/// Then they go out in batches of 2, 2 and 1 and take about 3 seconds
#[tokio::test(start_paused = true)]
async fn test_five_fixes_in_three_batches() {
    let project = TestProject::with_files(5);
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_secs(1)));
    let ctx = RunContext::new(project.path(), lint_only_config(2));
    let (tx, mut rx) = mpsc::channel(256);
    let mut orch = Orchestrator::new(ctx, runner.clone()).unwrap().with_events(tx);

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Converged);
    assert_eq!(runner.calls_to("eslint-fix"), 5);
    assert_eq!(runner.peak_concurrency(), 2);

    let took = report.iterations[0].duration_secs;
    assert!((3.0..4.0).contains(&took), "took {}s", took);

    let mut started = 0;
    let mut finished = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            RunEvent::TaskStarted { .. } => started += 1,
            RunEvent::TaskFinished { success, .. } => {
                assert!(success);
                finished += 1;
            }
            _ => {}
        }
    }
    assert_eq!((started, finished), (5, 5));
}

/// Test: Target exclusivity
/// Given two tasks on the same file and one on another
/// When batches are dispatched through the pool
/// Then the same file is never worked on by two tasks at once
#[tokio::test(start_paused = true)]
async fn test_same_target_is_never_concurrent() {
    let project = TestProject::with_files(0);
    project.write("a.ts", "a\n");
    project.write("b.ts", "b\n");
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_secs(1)));
    let pool = WorkerPool::from_config(&lint_only_config(3), project.path(), runner.clone()).unwrap();

    let mut scheduler = Scheduler::new();
    for target in ["a.ts", "a.ts", "b.ts"] {
        scheduler
            .add(fix_task(target, Priority::Normal, Duration::from_secs(1)))
            .unwrap();
    }

    let mut batches: Vec<Vec<PathBuf>> = Vec::new();
    loop {
        let batch = scheduler.get_ready(pool.capacity(), Duration::from_secs(900));
        if batch.is_empty() {
            break;
        }
        batches.push(batch.iter().filter_map(|t| t.target.clone()).collect());
        for result in pool.dispatch(&batch).await {
            assert!(result.success);
            scheduler.mark_completed(result.task_id, result.duration, true).unwrap();
        }
    }

    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 2);
    assert!(batches[0].contains(&PathBuf::from("a.ts")));
    assert!(batches[0].contains(&PathBuf::from("b.ts")));
    assert_eq!(batches[1], vec![PathBuf::from("a.ts")]);
    assert_eq!(runner.peak_concurrency(), 2);

    assert!(scheduler
        .estimator()
        .estimate(TaskType::FixLint, Priority::Normal)
        .is_some());
    assert!(runner.calls().iter().all(|inv| inv.cwd == project.root));
}

/// Test: Wall-clock budget
/// Given a one-second budget and fixes that take two seconds
/// When the first batch returns
/// Then the run stops with BudgetExhausted
#[tokio::test(start_paused = true)]
async fn test_wall_clock_budget_stops_the_run() {
    let project = TestProject::with_files(4);
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_secs(2)));
    let mut config = lint_only_config(1);
    config.run.wall_clock_secs = 1;
    let ctx = RunContext::new(project.path(), config);
    let mut orch = Orchestrator::new(ctx, runner.clone()).unwrap();

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::BudgetExhausted);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(runner.calls_to("eslint-fix"), 1);
    assert!(report.iterations.is_empty());
}
