//! Scheduler properties under randomized workloads.
//!
//! These tests drive the scheduler directly with seeded random task graphs
//! and check the guarantees every batch must keep.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_test::{assert_err, assert_ok};

use mend::core::{Priority, Task, TaskId, TaskStatus, TaskType};
use mend::orchestration::Scheduler;
use mend::Error;

use crate::fixtures::{command_task, fix_task};

const PRIORITIES: [Priority; 4] = [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

/// A random DAG: every task may depend on up to three earlier tasks.
fn random_workload(rng: &mut StdRng, size: usize, targets: usize) -> Vec<Task> {
    (0..size)
        .map(|n| {
            let priority = PRIORITIES[rng.gen_range(0..PRIORITIES.len())];
            let estimate = Duration::from_secs(rng.gen_range(1..=20));
            let mut task = if targets > 0 && rng.gen_bool(0.7) {
                fix_task(&format!("src/t{}.ts", rng.gen_range(0..targets)), priority, estimate)
            } else {
                command_task(TaskType::TypeCheck, priority, "tsc").with_estimate(estimate)
            };
            task = task.with_complexity(rng.gen_range(0..15));
            if n > 0 {
                for _ in 0..rng.gen_range(0..=3) {
                    // Ids are assigned from 1 in insertion order.
                    task = task.depends_on(TaskId(rng.gen_range(1..=n as u64)));
                }
            }
            task
        })
        .collect()
}

/// Test: Randomized workloads
/// Given seeded random DAGs with shared targets
/// When batches are drained until idle
/// Then no task is dispatched twice, dependencies always finish first,
/// targets never overlap within a batch, and the duration cap holds
#[test]
fn test_random_workloads_keep_batch_invariants() {
    for seed in 0..25u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = rng.gen_range(10..60);
        let tasks = random_workload(&mut rng, size, 6);
        let dependencies: HashMap<TaskId, Vec<TaskId>> = tasks
            .iter()
            .enumerate()
            .map(|(n, t)| (TaskId(n as u64 + 1), t.dependencies.iter().copied().collect()))
            .collect();

        let mut scheduler = Scheduler::new();
        for task in tasks {
            assert_ok!(scheduler.add(task));
        }

        let cap = Duration::from_secs(30);
        let mut dispatched: HashSet<TaskId> = HashSet::new();
        let mut finished: HashSet<TaskId> = HashSet::new();
        let mut rounds = 0;

        while !scheduler.is_idle() {
            rounds += 1;
            assert!(rounds <= size * 2, "seed {}: scheduler made no progress", seed);

            let width = rng.gen_range(1..=5);
            let batch = scheduler.get_ready(width, cap);
            assert!(!batch.is_empty(), "seed {}: work queued but nothing ready", seed);
            assert!(batch.len() <= width);

            let total: Duration = batch.iter().map(|t| t.estimated_duration).sum();
            assert!(batch.len() == 1 || total <= cap, "seed {}: batch over the cap", seed);

            let mut targets = HashSet::new();
            for task in &batch {
                assert!(dispatched.insert(task.id), "seed {}: {} dispatched twice", seed, task.id);
                for dep in &dependencies[&task.id] {
                    assert!(finished.contains(dep), "seed {}: {} ran before {}", seed, task.id, dep);
                }
                if let Some(target) = &task.target {
                    assert!(targets.insert(target.clone()), "seed {}: target shared in batch", seed);
                }
                assert_eq!(scheduler.status(task.id), Some(TaskStatus::Dispatched));
            }

            for task in batch {
                let success = rng.gen_bool(0.8);
                assert_ok!(scheduler.mark_completed(task.id, Duration::from_millis(10), success));
                finished.insert(task.id);
            }
        }

        assert_eq!(dispatched.len(), size, "seed {}: every task runs exactly once", seed);
        assert_eq!(scheduler.completed_count(), size);
    }
}

/// Test: Priority order
/// Given untargeted tasks with mixed priorities and no dependencies
/// When one wide batch is taken
/// Then it comes out most urgent first
#[test]
fn test_independent_tasks_come_out_in_priority_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut scheduler = Scheduler::new();
    for _ in 0..40 {
        let priority = PRIORITIES[rng.gen_range(0..PRIORITIES.len())];
        scheduler
            .add(command_task(TaskType::LintCheck, priority, "eslint").with_estimate(Duration::from_secs(1)))
            .unwrap();
    }

    let batch = scheduler.get_ready(40, Duration::from_secs(3600));
    assert_eq!(batch.len(), 40);
    assert!(batch.windows(2).all(|w| w[0].priority <= w[1].priority));
}

/// Test: Oversized task
/// Given a task whose estimate alone exceeds the cap
/// When the batch is empty
/// Then it is dispatched on its own instead of starving
#[test]
fn test_oversized_task_runs_alone() {
    let mut scheduler = Scheduler::new();
    scheduler
        .add(fix_task("big.ts", Priority::Critical, Duration::from_secs(120)))
        .unwrap();
    scheduler
        .add(fix_task("small.ts", Priority::Low, Duration::from_secs(1)))
        .unwrap();

    let first = scheduler.get_ready(4, Duration::from_secs(60));
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].target.as_deref(), Some(std::path::Path::new("big.ts")));

    let second = scheduler.get_ready(4, Duration::from_secs(60));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].target.as_deref(), Some(std::path::Path::new("small.ts")));
}

/// Test: Forward references
/// Given B submitted with a dependency on a reserved id
/// When A is added later under that id
/// Then A dispatches first and B only after A completes
#[test]
fn test_reserved_id_orders_late_prerequisite() {
    let mut scheduler = Scheduler::new();
    let a_id = scheduler.reserve_id();

    let b = command_task(TaskType::LintCheck, Priority::Critical, "eslint").depends_on(a_id);
    let b_id = scheduler.add(b).unwrap();
    assert_eq!(scheduler.status(b_id), Some(TaskStatus::Queued));
    assert_eq!(scheduler.blocked_count(), 1);
    assert!(scheduler.get_ready(4, Duration::from_secs(60)).is_empty());

    let mut a = command_task(TaskType::TypeCheck, Priority::Low, "tsc");
    a.id = a_id;
    assert_eq!(scheduler.add(a).unwrap(), a_id);

    let first = scheduler.get_ready(4, Duration::from_secs(60));
    assert_eq!(first.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a_id]);

    scheduler.mark_completed(a_id, Duration::from_secs(1), true).unwrap();
    let second = scheduler.get_ready(4, Duration::from_secs(60));
    assert_eq!(second.iter().map(|t| t.id).collect::<Vec<_>>(), vec![b_id]);
}

/// Test: Double insertion
/// Given a task that already carries an unreserved id
/// When it is added
/// Then the scheduler rejects it
#[test]
fn test_task_with_foreign_id_is_rejected() {
    let mut scheduler = Scheduler::new();
    let mut task = command_task(TaskType::TypeCheck, Priority::Normal, "tsc");
    task.id = TaskId(42);
    let err = assert_err!(scheduler.add(task));
    assert!(matches!(err, Error::Validation(_)));
}

/// Test: Completion bookkeeping
/// Given a task that is not running
/// When it is marked completed
/// Then the call fails and nothing changes
#[test]
fn test_completing_unknown_task_fails() {
    let mut scheduler = Scheduler::new();
    let id = scheduler
        .add(command_task(TaskType::TypeCheck, Priority::Normal, "tsc"))
        .unwrap();
    let err = assert_err!(scheduler.mark_completed(id, Duration::ZERO, true));
    assert!(matches!(err, Error::TaskNotRunning { .. }));
    assert_eq!(scheduler.ready_count(), 1);
}
