//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted command runner with per-program replies
//! - Temporary project trees
//! - Configurations wired to scripted programs

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use mend::config::{Config, RunSettings};
use mend::core::{Priority, Task, TaskType};
use mend::runner::{CommandOutput, CommandRunner, CommandSpec, Invocation};

type Effect = Arc<dyn Fn(&Invocation) + Send + Sync>;

/// A `CommandRunner` that answers from a script instead of spawning processes.
///
/// Each program has a queue of replies. Replies are consumed in order and the
/// last one repeats. Unscripted programs succeed with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    effects: HashMap<String, Effect>,
    delay: Duration,
    calls: Mutex<Vec<Invocation>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `program`.
    pub fn reply(self, program: &str, outputs: impl IntoIterator<Item = CommandOutput>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .extend(outputs);
        self
    }

    /// `program` always fails with the given stderr.
    pub fn failing(self, program: &str, stderr: &str) -> Self {
        self.reply(program, [CommandOutput::failure(1, "", stderr)])
    }

    /// Run `effect` every time `program` is invoked, before replying.
    pub fn with_effect(mut self, program: &str, effect: impl Fn(&Invocation) + Send + Sync + 'static) -> Self {
        self.effects.insert(program.to_string(), Arc::new(effect));
        self
    }

    /// Every invocation sleeps this long (tokio time, so paused clocks apply).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| inv.program == program)
            .count()
    }

    /// Most invocations observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, program: &str) -> CommandOutput {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(program) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| CommandOutput::success("")),
            None => CommandOutput::success(""),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn execute(&self, invocation: &Invocation) -> CommandOutput {
        self.calls.lock().unwrap().push(invocation.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(effect) = self.effects.get(&invocation.program) {
            effect(invocation);
        }
        let reply = self.next_reply(&invocation.program);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// A temporary project tree.
pub struct TestProject {
    /// Keeps the directory alive.
    pub temp_dir: TempDir,
    pub root: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();
        Self { temp_dir, root }
    }

    /// A project with `count` clean TypeScript files `src/file_<n>.ts`.
    pub fn with_files(count: usize) -> Self {
        let project = Self::new();
        for n in 0..count {
            project.write(&format!("src/file_{}.ts", n), &format!("export const v{} = {};\n", n, n));
        }
        project
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel)).expect("Failed to read file")
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

/// Run settings with no hidden parallelism and a short stagnation window.
pub fn run_settings(max_iterations: u32, stagnation_window: u32) -> RunSettings {
    RunSettings {
        max_iterations,
        stagnation_window,
        pool_size: Some(2),
        max_pool_size: 4,
        ..Default::default()
    }
}

/// A config with `fix_lint` (program `eslint-fix`) and `type_check`
/// (program `tsc`) configured.
pub fn lint_and_typecheck_config(max_iterations: u32, stagnation_window: u32) -> Config {
    let mut config = Config {
        run: run_settings(max_iterations, stagnation_window),
        ..Default::default()
    };
    config
        .tools
        .commands_mut(TaskType::FixLint)
        .push(CommandSpec::new("eslint-fix", ["--fix", "{target}"]));
    config
        .tools
        .commands_mut(TaskType::TypeCheck)
        .push(CommandSpec::new("tsc", ["--noEmit"]));
    config
}

/// A failing type check line the default patterns classify as one error.
pub fn tsc_error(line: &str) -> CommandOutput {
    CommandOutput::failure(2, format!("src/file_0.ts(1,1): error TS2322: {}", line), "")
}

/// An untargeted task running `program`.
pub fn command_task(task_type: TaskType, priority: Priority, program: &str) -> Task {
    Task::new(task_type, priority).with_command(CommandSpec::new(program, Vec::<String>::new()))
}

/// A targeted fix task with the given estimate.
pub fn fix_task(target: &str, priority: Priority, estimate: Duration) -> Task {
    Task::new(TaskType::FixLint, priority)
        .with_target(target)
        .with_command(CommandSpec::new("eslint-fix", ["{target}"]))
        .with_estimate(estimate)
}
