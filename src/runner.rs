//! External command execution.
//!
//! Every tool mend drives (type checker, linter, formatter, build tool,
//! auditor) goes through [`CommandRunner`]. The runner never returns an
//! error: spawn failures and timeouts come back as a failed
//! [`CommandOutput`] with a synthetic stderr message, so a broken tool is
//! data for the worker rather than a reason to stop the run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::mlog_trace;
use crate::util::expand_placeholders;

/// Default cap on captured stdout/stderr (1 MiB each).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// A configured command, before placeholder expansion.
///
/// Arguments may contain `{target}` (the task's file, relative to the root)
/// and `{root}` (the project root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Overrides the run-wide command timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Working directory relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            timeout_secs: None,
            cwd: None,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Expand placeholders and resolve the working directory.
    pub fn invocation(&self, target: Option<&Path>, root: &Path, default_timeout: Duration) -> Invocation {
        Invocation {
            program: self.program.clone(),
            args: self
                .args
                .iter()
                .map(|arg| expand_placeholders(arg, target, root))
                .collect(),
            cwd: match &self.cwd {
                Some(dir) => root.join(dir),
                None => root.to_path_buf(),
            },
            env: self.env.clone(),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A fully resolved command ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Structured outcome of running a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    /// The command never produced an exit status.
    pub fn not_started(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            exit_code: None,
            stderr: message.into(),
            ..Default::default()
        }
    }

    pub fn timed_out(program: &str, timeout: Duration) -> Self {
        Self {
            succeeded: false,
            exit_code: None,
            stderr: format!("{} timed out after {}s", program, timeout.as_secs_f64()),
            timed_out: true,
            ..Default::default()
        }
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// The seam between mend and the outside world.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion or timeout. Never fails.
    async fn execute(&self, invocation: &Invocation) -> CommandOutput;
}

/// Runs commands as child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    max_output_bytes: usize,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Whether `program` resolves on `PATH` (or is an existing path).
    pub fn is_available(program: &str) -> bool {
        which::which(program).is_ok()
    }

}

/// Read `stream` to the end, keeping at most `limit` bytes.
///
/// The rest is drained and dropped so the child never blocks on a full pipe.
async fn read_capped<R>(stream: Option<R>, limit: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return Ok(String::new());
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        truncated |= n > room;
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n[output truncated]");
    }
    Ok(text)
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(&self, invocation: &Invocation) -> CommandOutput {
        mlog_trace!("exec: {} (cwd={})", invocation.command_line(), invocation.cwd.display());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput::not_started(format!(
                    "failed to start {}: {}",
                    invocation.program, e
                ))
            }
        };

        let limit = self.max_output_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async move {
            let (stdout, stderr) = tokio::join!(read_capped(stdout, limit), read_capped(stderr, limit));
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout?, stderr?))
        };

        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(invocation.timeout, collect).await {
            Ok(Ok((status, stdout, stderr))) => CommandOutput {
                succeeded: status.success(),
                exit_code: status.code(),
                stdout,
                stderr,
                timed_out: false,
            },
            Ok(Err(e)) => CommandOutput::not_started(format!(
                "failed to collect output of {}: {}",
                invocation.program, e
            )),
            Err(_) => CommandOutput::timed_out(&invocation.program, invocation.timeout),
        }
    }
}
