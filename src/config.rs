use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::task::TaskType;
use crate::orchestration::worker::{OutputPatterns, WorkerKind, DEFAULT_ERROR_PATTERN, DEFAULT_WARNING_PATTERN};
use crate::runner::{CommandSpec, DEFAULT_MAX_OUTPUT_BYTES};
use crate::{mlog_debug, Error, Result};

pub const CONFIG_FILE: &str = "mend.toml";
pub const STATE_DIR: &str = ".mend";

/// Upper bound for the automatically sized pool.
pub const AUTO_POOL_LIMIT: usize = 16;

/// `available_parallelism` clamped to `[1, 16]`.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, AUTO_POOL_LIMIT)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Extra command variants per worker kind, tried first once escalated.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub escalation: BTreeMap<String, Vec<CommandSpec>>,
    /// Output patterns per worker kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub patterns: BTreeMap<String, PatternConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Overall score required to converge (0-100).
    pub threshold: f64,
    pub max_iterations: u32,
    pub wall_clock_secs: u64,
    /// Concurrent tasks per batch. Defaults to the available parallelism.
    pub pool_size: Option<usize>,
    /// Ceiling for the pool after escalation.
    pub max_pool_size: usize,
    pub stagnation_window: u32,
    pub max_retries: u32,
    pub max_batches_per_phase: u32,
    /// Summed estimated duration allowed in one batch.
    pub batch_budget_secs: u64,
    pub command_timeout_secs: u64,
    /// Cap on captured stdout and on captured stderr per command.
    pub max_output_bytes: usize,
    pub escalation_extra_workers: usize,
    pub stall_iterations: u32,
    /// State directory, relative to the project root unless absolute.
    pub state_dir: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            threshold: 99.0,
            max_iterations: 10,
            wall_clock_secs: 3600,
            pool_size: None,
            max_pool_size: 16,
            stagnation_window: 3,
            max_retries: 2,
            max_batches_per_phase: 64,
            batch_budget_secs: 900,
            command_timeout_secs: 300,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            escalation_extra_workers: 2,
            stall_iterations: 2,
            state_dir: None,
        }
    }
}

impl RunSettings {
    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(default_pool_size).max(1)
    }

    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }

    pub fn batch_budget(&self) -> Duration {
        Duration::from_secs(self.batch_budget_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// File extensions (without the dot) that are fix targets.
    pub extensions: Vec<String>,
    /// Path prefixes or directory names skipped during discovery.
    pub exclude: Vec<String>,
    /// Complexity at or above which a target is scheduled at normal priority.
    pub complexity_threshold: u32,
    /// Cap on targets per iteration. 0 means unlimited.
    pub max_targets: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            extensions: ["ts", "tsx", "js", "jsx"].iter().map(|s| s.to_string()).collect(),
            exclude: ["node_modules", "dist", "build", "coverage"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            complexity_threshold: 10,
            max_targets: 0,
        }
    }
}

/// Command variants per task type. Empty means the task type is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolsConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fix_syntax: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fix_types: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fix_lint: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub format: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub type_check: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lint_check: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub format_check: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build_check: Vec<CommandSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_audit: Vec<CommandSpec>,
}

impl ToolsConfig {
    pub fn commands(&self, task_type: TaskType) -> &[CommandSpec] {
        match task_type {
            TaskType::Setup => &self.setup,
            TaskType::FixSyntax => &self.fix_syntax,
            TaskType::FixTypes => &self.fix_types,
            TaskType::FixLint => &self.fix_lint,
            TaskType::Format => &self.format,
            TaskType::TypeCheck => &self.type_check,
            TaskType::LintCheck => &self.lint_check,
            TaskType::FormatCheck => &self.format_check,
            TaskType::BuildCheck => &self.build_check,
            TaskType::SecurityAudit => &self.security_audit,
        }
    }

    pub fn commands_mut(&mut self, task_type: TaskType) -> &mut Vec<CommandSpec> {
        match task_type {
            TaskType::Setup => &mut self.setup,
            TaskType::FixSyntax => &mut self.fix_syntax,
            TaskType::FixTypes => &mut self.fix_types,
            TaskType::FixLint => &mut self.fix_lint,
            TaskType::Format => &mut self.format,
            TaskType::TypeCheck => &mut self.type_check,
            TaskType::LintCheck => &mut self.lint_check,
            TaskType::FormatCheck => &mut self.format_check,
            TaskType::BuildCheck => &mut self.build_check,
            TaskType::SecurityAudit => &mut self.security_audit,
        }
    }

    /// Validators with at least one command.
    pub fn validators(&self) -> Vec<TaskType> {
        TaskType::VALIDATORS
            .into_iter()
            .filter(|tt| !self.commands(*tt).is_empty())
            .collect()
    }

    /// Every configured program, deduplicated.
    pub fn programs(&self) -> Vec<&str> {
        let mut programs: Vec<&str> = TaskType::ALL
            .iter()
            .flat_map(|tt| self.commands(*tt))
            .map(|spec| spec.program.as_str())
            .collect();
        programs.sort_unstable();
        programs.dedup();
        programs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub error: String,
    pub warning: String,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            error: DEFAULT_ERROR_PATTERN.to_string(),
            warning: DEFAULT_WARNING_PATTERN.to_string(),
        }
    }
}

impl Config {
    pub fn global_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(STATE_DIR))
    }

    pub fn global_path() -> Result<PathBuf> {
        Ok(Self::global_dir()?.join(CONFIG_FILE))
    }

    /// Load configuration for a project.
    ///
    /// Order: `explicit`, `<root>/mend.toml`, `~/.mend/mend.toml`, defaults.
    /// An explicit path that does not exist is an error.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            mlog_debug!("Config::load explicit path={}", path.display());
            if !path.exists() {
                return Err(Error::InvalidConfig(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Self::load_from(path);
        }

        let local = root.join(CONFIG_FILE);
        if local.exists() {
            mlog_debug!("Config::load project path={}", local.display());
            return Self::load_from(&local);
        }

        if let Ok(global) = Self::global_path() {
            if global.exists() {
                mlog_debug!("Config::load global path={}", global.display());
                return Self::load_from(&global);
            }
        }

        mlog_debug!("Config file not found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        mlog_debug!(
            "Config loaded: threshold={}, max_iterations={}, validators={:?}",
            config.run.threshold,
            config.run.max_iterations,
            config.tools.validators()
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject values the run loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        if !(0.0..=100.0).contains(&run.threshold) {
            return Err(Error::InvalidConfig(format!(
                "run.threshold must be within 0..=100, got {}",
                run.threshold
            )));
        }
        let positive = [
            ("run.max_iterations", run.max_iterations as u64),
            ("run.wall_clock_secs", run.wall_clock_secs),
            ("run.max_pool_size", run.max_pool_size as u64),
            ("run.stagnation_window", run.stagnation_window as u64),
            ("run.max_batches_per_phase", run.max_batches_per_phase as u64),
            ("run.batch_budget_secs", run.batch_budget_secs),
            ("run.command_timeout_secs", run.command_timeout_secs),
            ("run.max_output_bytes", run.max_output_bytes as u64),
            ("run.stall_iterations", run.stall_iterations as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }
        if run.pool_size == Some(0) {
            return Err(Error::InvalidConfig("run.pool_size must be at least 1".to_string()));
        }
        if self.discovery.extensions.iter().any(|e| e.is_empty() || e.starts_with('.')) {
            return Err(Error::InvalidConfig(
                "discovery.extensions must be bare extensions like \"ts\"".to_string(),
            ));
        }
        for key in self.escalation.keys().chain(self.patterns.keys()) {
            if WorkerKind::parse(key).is_none() {
                return Err(Error::InvalidConfig(format!("unknown worker kind: {}", key)));
            }
        }
        for (kind, patterns) in &self.patterns {
            OutputPatterns::new(&patterns.error, &patterns.warning)
                .map_err(|e| Error::InvalidConfig(format!("patterns.{}: {}", kind, e)))?;
        }
        for tt in TaskType::ALL {
            if self.tools.commands(tt).iter().any(|spec| spec.program.trim().is_empty()) {
                return Err(Error::InvalidConfig(format!("tools.{} has an empty program", tt)));
            }
        }
        Ok(())
    }

    pub fn state_dir(&self, root: &Path) -> PathBuf {
        match &self.run.state_dir {
            Some(dir) => {
                let dir = expand_tilde(dir);
                if dir.is_absolute() {
                    dir
                } else {
                    root.join(dir)
                }
            }
            None => root.join(STATE_DIR),
        }
    }

    pub fn escalation_for(&self, kind: WorkerKind) -> Vec<CommandSpec> {
        self.escalation.get(kind.as_str()).cloned().unwrap_or_default()
    }

    pub fn patterns_for(&self, kind: WorkerKind) -> Result<OutputPatterns> {
        match self.patterns.get(kind.as_str()) {
            Some(p) => OutputPatterns::new(&p.error, &p.warning),
            None => Ok(OutputPatterns::default()),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
