//! Runner module - Execution abstraction layer
//!
//! This module provides:
//! - `CommandRunner`: the seam over launching an external process with a deadline
//! - `ProcessRunner`: the real implementation over `tokio::process`
//! - `ContainerTaskRunner`: one task's unit of work, which builds the container
//!   invocation and turns its exit code into a `TaskResult`
//!
//! The runner module does NOT:
//! - Decide which algorithm a request maps to
//! - Persist results (the engine's reconciliation loop does that)

pub mod container;
pub mod process;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Exit code reported when the wall-clock limit elapses
pub const RUNTIME_LIMIT_EXIT_CODE: i32 = 500;

/// Command specification for execution
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.clone());
        v
    }

    /// Fully expanded command line, quoted so it can be pasted into a shell
    pub fn command_line(&self) -> String {
        self.to_vec()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Failure launching or waiting on an external process
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Unable to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The enclosing task was cancelled; the process has been killed
    #[error("process was cancelled")]
    Cancelled,
}

/// Returned by a unit of work whose task was cancelled mid-run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task {0} was cancelled")]
pub struct TaskCancelled(pub String);

/// Runs an external command to completion, timeout or cancellation
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` with stdout/stderr redirected to the given files.
    ///
    /// Returns the exit code, or `RUNTIME_LIMIT_EXIT_CODE` if `timeout`
    /// elapsed first. Cancellation kills the process and yields
    /// `ExecError::Cancelled`.
    async fn run(
        &self,
        cmd: &CommandSpec,
        timeout: Duration,
        stdout_file: &Path,
        stderr_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<i32, ExecError>;

    /// The fully expanded command line of the last `run`
    fn last_command(&self) -> Option<String>;
}

// Re-exports
pub use container::{ContainerTaskRunner, RunnerSettings};
pub use process::ProcessRunner;
