//! End-to-end convergence loop tests.
//!
//! Each test runs the orchestrator against a temporary project with a
//! scripted runner standing in for the real tools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use mend::config::Config;
use mend::core::{Priority, Task, TaskType};
use mend::orchestration::{Orchestrator, RunContext, RunEvent, WorkerKind};
use mend::runner::{CommandOutput, CommandSpec};
use mend::state::StateDir;
use mend::RunOutcome;

use crate::fixtures::{lint_and_typecheck_config, tsc_error, ScriptedRunner, TestProject};

fn orchestrator(project: &TestProject, config: Config, runner: Arc<ScriptedRunner>) -> Orchestrator {
    let ctx = RunContext::new(project.path(), config);
    Orchestrator::new(ctx, runner).expect("valid config")
}

/// Test: Nothing to do
/// Given an empty tree and no validators
/// When the loop runs
/// Then it converges in the first iteration with a perfect score
#[tokio::test]
async fn test_empty_project_converges_immediately() {
    let project = TestProject::new();
    let runner = Arc::new(ScriptedRunner::new());
    let mut orch = orchestrator(&project, Config::default(), runner.clone());

    let report = assert_ok!(orch.run().await);
    assert_eq!(report.outcome, RunOutcome::Converged);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.iterations.len(), 1);
    assert_eq!(report.final_score, 100.0);
    assert!(report.remaining_errors.is_empty());
    assert!(runner.calls().is_empty());
}

/// Test: Fixes take effect
/// Given a type check that fails once and then passes
/// When the loop runs
/// Then the second iteration converges and the score trend rises
#[tokio::test]
async fn test_converges_after_fix() {
    let project = TestProject::with_files(2);
    let runner = Arc::new(ScriptedRunner::new().reply(
        "tsc",
        [tsc_error("Type 'string' is not assignable"), CommandOutput::success("")],
    ));
    let mut orch = orchestrator(&project, lint_and_typecheck_config(5, 3), runner.clone());

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Converged);
    assert_eq!(report.score_trend(), vec![95.0, 100.0]);
    assert_eq!(report.best_score, 100.0);
    assert!(report.iterations[1].converged);
    assert_eq!(report.iterations[0].errors, 1);
    assert_eq!(runner.calls_to("tsc"), 2);
}

/// Test: ConvergenceFailure
/// Given two type errors no fixer can remove
/// When max_iterations runs out before the stagnation window fills
/// Then the outcome is ConvergenceFailure and both errors are listed
#[tokio::test]
async fn test_persistent_errors_are_convergence_failure() {
    let project = TestProject::with_files(1);
    let output = CommandOutput::failure(
        2,
        "src/a.ts(3,1): error TS2304: Cannot find name 'x'.\nsrc/b.ts(9,4): error TS2322: Type mismatch.",
        "",
    );
    let runner = Arc::new(ScriptedRunner::new().reply("tsc", [output]));
    let mut orch = orchestrator(&project, lint_and_typecheck_config(3, 3), runner);

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::ConvergenceFailure);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.iterations.len(), 3);
    assert!(report.iterations.iter().all(|it| it.errors == 2));
    assert!(report.escalations.is_empty());
    assert_eq!(report.remaining_errors.len(), 2);
    assert!(report.remaining_errors[0].starts_with("type_check: "));
    assert!(report.remaining_errors[0].contains("Cannot find name 'x'"));
    assert!(report.remaining_errors[1].contains("TS2322"));
    assert!(report.to_string().contains("remaining errors:"));
}

/// Test: Best score never decreases
/// Given validator scores that go up and down
/// When the loop runs
/// Then every iteration's best score is the running maximum
#[tokio::test]
async fn test_best_score_is_monotonic() {
    let project = TestProject::with_files(1);
    let two_errors = CommandOutput::failure(2, "a.ts: error TS1\nb.ts: error TS2", "");
    let runner = Arc::new(ScriptedRunner::new().reply(
        "tsc",
        [
            two_errors.clone(),
            tsc_error("one left"),
            two_errors.clone(),
            two_errors,
        ],
    ));
    let mut orch = orchestrator(&project, lint_and_typecheck_config(4, 5), runner);

    let report = orch.run().await.unwrap();
    let trend = report.score_trend();
    assert_eq!(trend, vec![90.0, 95.0, 90.0, 90.0]);

    let bests: Vec<f64> = report.iterations.iter().map(|it| it.best_score).collect();
    assert_eq!(bests, vec![90.0, 95.0, 95.0, 95.0]);
    assert_eq!(report.best_score, 95.0);
}

/// Test: Stagnation escalates, then stops
/// Given a stagnation window of one and an error that never goes away
/// When the loop runs
/// Then the weakest worker is escalated once and the run ends Stagnated
#[tokio::test]
async fn test_stagnation_escalates_then_stagnates() {
    let project = TestProject::with_files(1);
    let runner = Arc::new(
        ScriptedRunner::new()
            .reply("tsc", [tsc_error("stuck")])
            .reply("tsc-strict", [tsc_error("still stuck")]),
    );
    let mut config = lint_and_typecheck_config(10, 1);
    config
        .escalation
        .insert("type".to_string(), vec![CommandSpec::new("tsc-strict", ["--noEmit"])]);
    let mut orch = orchestrator(&project, config, runner.clone());

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Stagnated);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.iterations.len(), 3);

    assert_eq!(report.escalations.len(), 1);
    let escalation = &report.escalations[0];
    assert_eq!(escalation.worker, WorkerKind::Type);
    assert_eq!(escalation.iteration, 2);
    assert_eq!(escalation.pool_capacity, 4);
    assert_eq!(report.iterations[1].escalated, Some(WorkerKind::Type));

    // The escalated worker tries its extra variant first from then on.
    assert_eq!(runner.calls_to("tsc-strict"), 1);
    assert_eq!(orch.pool().capacity(), 4);
}

/// Test: Idempotent targets
/// Given a fixer that leaves a file untouched and a failing validator
/// When several iterations run
/// Then the settled file is not fixed again
#[tokio::test]
async fn test_clean_targets_are_not_refixed() {
    let project = TestProject::with_files(1);
    let runner = Arc::new(ScriptedRunner::new().reply("tsc", [tsc_error("elsewhere")]));
    let mut orch = orchestrator(&project, lint_and_typecheck_config(3, 3), runner.clone());

    let report = orch.run().await.unwrap();
    assert_eq!(report.iterations.len(), 3);
    assert_eq!(runner.calls_to("eslint-fix"), 1);
    assert_eq!(report.iterations[1].tasks_dispatched, 1);
    assert_eq!(report.iterations[0].score, report.iterations[2].score);
}

/// Test: Changed targets are replanned
/// Given a validator run that edits a settled file once
/// When the next iteration discovers targets
/// Then the edited file goes through the fix chain again
#[tokio::test]
async fn test_modified_target_is_refixed() {
    let project = TestProject::with_files(1);
    let edited = project.root.join("src/file_0.ts");
    let edits = Arc::new(AtomicUsize::new(0));
    let runner = Arc::new(
        ScriptedRunner::new()
            .reply("tsc", [tsc_error("still failing")])
            .with_effect("tsc", move |_| {
                if edits.fetch_add(1, Ordering::SeqCst) == 0 {
                    std::fs::write(&edited, "export const v0 = 'edited';\n").unwrap();
                }
            }),
    );
    let mut orch = orchestrator(&project, lint_and_typecheck_config(3, 3), runner.clone());

    let report = orch.run().await.unwrap();
    assert_eq!(report.iterations.len(), 3);
    assert_eq!(runner.calls_to("eslint-fix"), 2);
}

/// Test: Fixers report content changes
/// Given a fixer that rewrites its target
/// When the fix phase runs
/// Then the iteration counts the target as changed
#[tokio::test]
async fn test_fixer_changes_are_counted() {
    let project = TestProject::with_files(2);
    let root = project.root.clone();
    let runner = Arc::new(ScriptedRunner::new().with_effect("eslint-fix", move |inv| {
        let target = inv.args.last().cloned().unwrap_or_default();
        std::fs::write(root.join(target), "export const fixed = true;\n").unwrap();
    }));
    let mut orch = orchestrator(&project, lint_and_typecheck_config(2, 3), runner);

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Converged);
    assert_eq!(report.iterations[0].changed_targets, 2);
    assert_eq!(project.read("src/file_1.ts"), "export const fixed = true;\n");
}

/// Test: Stalled tasks are reported
/// Given a task waiting on a reserved id that is never filled
/// When the loop ends without converging
/// Then the task is listed as pending with what it waits on
#[tokio::test]
async fn test_stalled_task_is_reported() {
    let project = TestProject::with_files(1);
    let runner = Arc::new(ScriptedRunner::new().reply("tsc", [tsc_error("blocked")]));
    let mut config = lint_and_typecheck_config(3, 3);
    config.run.stall_iterations = 2;
    let mut orch = orchestrator(&project, config, runner);

    let (tx, mut rx) = mpsc::channel(1024);
    orch = orch.with_events(tx);

    let missing = orch.reserve_id();
    let orphan = Task::new(TaskType::FixTypes, Priority::High)
        .with_target("src/ghost.ts")
        .with_command(CommandSpec::new("tsc-fix", ["{target}"]))
        .depends_on(missing);
    let orphan_id = orch.submit(orphan).unwrap();

    let report = orch.run().await.unwrap();
    assert_eq!(report.pending.len(), 1);
    let stalled = &report.pending[0];
    assert_eq!(stalled.id, orphan_id);
    assert_eq!(stalled.waiting_on, vec![missing]);
    assert_eq!(stalled.pending_since, 1);
    assert!(!stalled.in_cycle);

    let mut stall_events = 0;
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::Stalled { tasks } = event {
            assert_eq!(tasks[0].id, orphan_id);
            stall_events += 1;
        }
    }
    assert_eq!(stall_events, 1, "a stall is announced once");
}

/// Test: Retries
/// Given a fixer that fails on its first attempt
/// When the fix phase drains
/// Then the task is retried within the same phase
#[tokio::test]
async fn test_failed_fix_is_retried() {
    let project = TestProject::with_files(1);
    let runner = Arc::new(ScriptedRunner::new().reply(
        "eslint-fix",
        [CommandOutput::failure(1, "", "eslint crashed"), CommandOutput::success("")],
    ));
    let mut orch = orchestrator(&project, lint_and_typecheck_config(2, 3), runner.clone());

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Converged);
    assert_eq!(runner.calls_to("eslint-fix"), 2);
    assert_eq!(report.iterations[0].tasks_dispatched, 3);
}

/// Test: Retries keep chain order
/// Given a type fixer that fails once and a lint fixer after it
/// When the failed type fix is retried
/// Then the lint fix waits for the retry instead of jumping ahead
#[tokio::test]
async fn test_retry_runs_before_the_rest_of_the_chain() {
    let project = TestProject::with_files(1);
    let runner = Arc::new(ScriptedRunner::new().reply(
        "tsc-fix",
        [CommandOutput::failure(1, "", "tsc-fix crashed"), CommandOutput::success("")],
    ));
    let mut config = lint_and_typecheck_config(2, 3);
    config
        .tools
        .commands_mut(TaskType::FixTypes)
        .push(CommandSpec::new("tsc-fix", ["{target}"]));
    let mut orch = orchestrator(&project, config, runner.clone());

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Converged);
    let programs: Vec<String> = runner.calls().into_iter().map(|inv| inv.program).collect();
    assert_eq!(programs, vec!["tsc-fix", "tsc-fix", "eslint-fix", "tsc"]);
}

/// Test: Capped fix phase
/// Given more urgent fixes than the fix phase may dispatch in one iteration
/// When the phase stops at its batch cap
/// Then the validators still run every iteration and the backlog carries over
#[tokio::test]
async fn test_capped_fix_phase_still_validates() {
    let project = TestProject::new();
    for n in 0..6 {
        // Unbalanced braces: suspected syntax errors, scheduled at high priority.
        project.write(&format!("src/broken_{}.ts", n), "export function f() {\n");
    }
    let runner = Arc::new(ScriptedRunner::new().reply("tsc", [tsc_error("still broken")]));
    let mut config = lint_and_typecheck_config(3, 5);
    config.run.pool_size = Some(1);
    config.run.max_batches_per_phase = 2;
    let (tx, mut rx) = mpsc::channel(256);
    let mut orch = orchestrator(&project, config, runner.clone()).with_events(tx);

    let report = orch.run().await.unwrap();
    assert_ne!(report.outcome, RunOutcome::Converged);
    assert_eq!(report.outcome, RunOutcome::ConvergenceFailure);
    assert_eq!(report.iterations.len(), 3);
    for iteration in &report.iterations {
        assert!(!iteration.converged);
        assert_eq!(iteration.validators.len(), 1);
        assert_eq!(iteration.validators[0].task_type, TaskType::TypeCheck);
        assert!(iteration.score < 100.0);
        // Two capped fix batches plus the type check.
        assert_eq!(iteration.tasks_dispatched, 3);
    }
    assert_eq!(runner.calls_to("tsc"), 3);
    assert_eq!(runner.calls_to("eslint-fix"), 6);
    assert!(report.pending.is_empty());

    // Waiting for capacity is not a stall.
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, RunEvent::Stalled { .. }));
    }
}

/// Test: Setup runs once
/// Given a setup command
/// When several iterations run
/// Then setup runs only in the first and fixes wait for it
#[tokio::test]
async fn test_setup_runs_first_and_once() {
    let project = TestProject::with_files(1);
    let runner = Arc::new(ScriptedRunner::new().reply("tsc", [tsc_error("x")]));
    let mut config = lint_and_typecheck_config(2, 3);
    config
        .tools
        .commands_mut(TaskType::Setup)
        .push(CommandSpec::new("npm", ["install"]));
    let mut orch = orchestrator(&project, config, runner.clone());

    orch.run().await.unwrap();
    let programs: Vec<String> = runner.calls().into_iter().map(|inv| inv.program).collect();
    assert_eq!(programs.iter().filter(|p| *p == "npm").count(), 1);
    assert_eq!(programs[0], "npm");
    assert_eq!(programs[1], "eslint-fix");
}

/// Test: Cancellation
/// Given a cancelled token
/// When the loop is asked to run
/// Then it stops with Interrupted
#[tokio::test]
async fn test_cancellation_interrupts() {
    let project = TestProject::with_files(1);
    let token = CancellationToken::new();
    token.cancel();
    let mut orch = orchestrator(&project, lint_and_typecheck_config(3, 3), Arc::new(ScriptedRunner::new()))
        .with_cancellation(token);

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.exit_code(), 130);
}

/// Test: State persistence
/// Given a state directory
/// When a run finishes
/// Then every iteration is in the history and durations are saved
#[tokio::test]
async fn test_history_and_durations_persist() {
    let project = TestProject::with_files(1);
    let runner = Arc::new(ScriptedRunner::new().reply("tsc", [tsc_error("x"), CommandOutput::success("")]));
    let config = lint_and_typecheck_config(5, 3);
    let state_path = config.state_dir(project.path());
    let mut orch = orchestrator(&project, config, runner).with_state().unwrap();

    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Converged);

    let state = StateDir::at(&state_path);
    let history = state.history().read(None).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|entry| entry.run_id == report.run_id));
    assert_eq!(history[1].record.index, 2);
    assert!(history[1].record.converged);
    assert_eq!(history[0].record.score, report.iterations[0].score);

    let durations = state.durations().load();
    assert!(durations.estimate(TaskType::TypeCheck, Priority::Normal).is_some());
    assert!(durations.estimate(TaskType::FixLint, Priority::Low).is_some());
}
