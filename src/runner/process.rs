//! Process runner implementation
//!
//! Launches a command directly, with stdout/stderr captured to files and a
//! wall-clock deadline. On timeout or cancellation the whole process group
//! is killed so no orphaned container client keeps running.

use async_trait::async_trait;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs::File;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommandRunner, CommandSpec, ExecError, RUNTIME_LIMIT_EXIT_CODE};

/// Runner that executes a command as a child process of this service
#[derive(Debug, Default)]
pub struct ProcessRunner {
    last_command: Mutex<Option<String>>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_command(&self, line: String) {
        if let Ok(mut last) = self.last_command.lock() {
            *last = Some(line);
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        timeout: Duration,
        stdout_file: &Path,
        stderr_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<i32, ExecError> {
        let line = cmd.command_line();
        debug!("Running command: {}", line);
        self.record_command(line);

        let stdout = File::create(stdout_file).await?.into_std().await;
        let stderr = File::create(stderr_file).await?.into_std().await;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        let deadline_at = Instant::now() + timeout;
        let deadline = tokio::time::sleep_until(deadline_at);
        tokio::pin!(deadline);

        // A finished process wins, then the deadline, then cancellation.
        // The timer may not have fired yet when a cancel lands past the
        // deadline, so the cancel arm re-checks the clock.
        tokio::select! {
            biased;
            status = child.wait() => Ok(exit_code(status?)),
            _ = &mut deadline => {
                warn!("Runtime limit of {:?} exceeded, killing {}", timeout, cmd.program);
                terminate(&mut child).await;
                Ok(RUNTIME_LIMIT_EXIT_CODE)
            }
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                if Instant::now() >= deadline_at {
                    warn!("Runtime limit of {:?} exceeded, killed {}", timeout, cmd.program);
                    return Ok(RUNTIME_LIMIT_EXIT_CODE);
                }
                info!("Cancellation requested, killed {}", cmd.program);
                Err(ExecError::Cancelled)
            }
        }
    }

    fn last_command(&self) -> Option<String> {
        self.last_command.lock().ok().and_then(|last| last.clone())
    }
}

/// Kill the child's process group, then the child itself, and reap it
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // process_group(0) made the child its own group leader
        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("killpg({}) failed: {}", pid, e);
            }
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Failed to kill child process: {}", e);
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
