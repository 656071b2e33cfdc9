//! Container task runner
//!
//! One `ContainerTaskRunner` is bound to exactly one task id and its working
//! directory. Construction prepares the directory and input file; `call`
//! launches the container and turns the exit code into a settled result.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    CommandRunner, CommandSpec, ExecError, ProcessRunner, TaskCancelled, RUNTIME_LIMIT_EXIT_CODE,
};
use crate::core::{TaskRequest, TaskResult};
use crate::error::EngineError;
use crate::store::ResultStore;

pub const INPUT_JSON_FILE: &str = "input.json";
pub const STD_OUT_FILE: &str = "stdout.txt";
pub const STD_ERR_FILE: &str = "stderr.txt";
pub const CMD_RUN_FILE: &str = "cmdrun.sh";

pub const RUNTIME_LIMIT_MESSAGE: &str = "Runtime limit exceeded";

/// Settings shared by every runner an engine creates
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Root directory; each task gets an id-named subdirectory
    pub task_dir: PathBuf,
    /// Container runtime binary, e.g. `docker` or `podman`
    pub docker_cmd: String,
    /// Suffix appended to the volume mount, e.g. `:ro` or `:ro,z`
    pub mount_options: Option<String>,
    /// Wall-clock limit for one container run
    pub timeout: Duration,
}

/// Single-use unit of work that runs one task inside a container
pub struct ContainerTaskRunner {
    id: String,
    image: String,
    request: TaskRequest,
    start_time: u64,
    work_dir: PathBuf,
    settings: RunnerSettings,
    command_runner: Box<dyn CommandRunner>,
    store: Option<ResultStore>,
}

impl ContainerTaskRunner {
    /// Create the task's working directory and write its input file
    pub async fn new(
        settings: &RunnerSettings,
        id: impl Into<String>,
        image: impl Into<String>,
        request: &TaskRequest,
        start_time: u64,
    ) -> Result<Self, EngineError> {
        let id = id.into();
        let work_dir = settings.task_dir.join(&id);

        fs::create_dir_all(&work_dir).await.map_err(|e| {
            error!("Unable to create {}: {}", work_dir.display(), e);
            EngineError::Internal(format!("Unable to create directory: {}", work_dir.display()))
        })?;

        let runner = Self {
            id,
            image: image.into(),
            request: request.clone(),
            start_time,
            work_dir,
            settings: settings.clone(),
            command_runner: Box::new(ProcessRunner::new()),
            store: None,
        };
        runner.write_input_file().await?;
        Ok(runner)
    }

    pub fn with_command_runner(mut self, command_runner: Box<dyn CommandRunner>) -> Self {
        self.command_runner = command_runner;
        self
    }

    /// Publish in-flight snapshots into this store
    pub fn with_result_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn input_file(&self) -> PathBuf {
        self.work_dir.join(INPUT_JSON_FILE)
    }

    pub fn stdout_file(&self) -> PathBuf {
        self.work_dir.join(STD_OUT_FILE)
    }

    pub fn stderr_file(&self) -> PathBuf {
        self.work_dir.join(STD_ERR_FILE)
    }

    pub fn command_run_file(&self) -> PathBuf {
        self.work_dir.join(CMD_RUN_FILE)
    }

    async fn write_input_file(&self) -> Result<(), EngineError> {
        let path = self.input_file();
        let text = self.request.input_text().unwrap_or_default();
        fs::write(&path, text).await.map_err(|e| {
            EngineError::Internal(format!("Unable to write {}: {}", path.display(), e))
        })
    }

    /// Full container invocation:
    /// `<docker> run --rm -v dir:dir<opts> <image> [name [value]]... <input>`
    pub fn build_command(&self) -> CommandSpec {
        let work_dir = absolute(&self.work_dir);
        let mount = format!(
            "{dir}:{dir}{opts}",
            dir = work_dir.display(),
            opts = self.settings.mount_options.as_deref().unwrap_or("")
        );

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            mount,
            self.image.clone(),
        ];
        if let Some(params) = &self.request.custom_parameters {
            for (name, value) in params {
                args.push(name.clone());
                if let Some(value) = value {
                    args.push(value.clone());
                }
            }
        }
        args.push(absolute(&self.input_file()).to_string_lossy().to_string());

        CommandSpec::new(&self.settings.docker_cmd)
            .with_args(args)
            .with_work_dir(work_dir)
    }

    /// Run the task to a settled result.
    ///
    /// Algorithm failures are encoded in the returned result; only
    /// cancellation is reported as an error.
    pub async fn call(&self, cancel: &CancellationToken) -> Result<TaskResult, TaskCancelled> {
        let started = Instant::now();
        let processing = TaskResult::processing(&self.id, self.start_time);
        if let Some(store) = &self.store {
            store.publish(processing.clone());
        }

        if !fs::try_exists(&self.work_dir).await.unwrap_or(false) {
            let message = format!(
                "Received error trying to run task: {} directory does not exist",
                self.work_dir.display()
            );
            warn!("{}", message);
            return Ok(processing.failed(message, None, elapsed_ms(started)));
        }

        let cmd = self.build_command();
        info!("Running task {} with image {}", self.id, self.image);
        let outcome = self
            .command_runner
            .run(
                &cmd,
                self.settings.timeout,
                &self.stdout_file(),
                &self.stderr_file(),
                cancel,
            )
            .await;
        self.write_command_run_file(&cmd).await;

        let exit_code = match outcome {
            Ok(code) => code,
            Err(ExecError::Cancelled) => {
                info!("Task {} was cancelled", self.id);
                return Err(TaskCancelled(self.id.clone()));
            }
            Err(e) => {
                error!("Task {} failed to run: {}", self.id, e);
                return Ok(processing.failed(
                    format!("Received error trying to run task: {}", e),
                    None,
                    elapsed_ms(started),
                ));
            }
        };

        let result = match exit_code {
            0 => {
                let payload = read_payload(&self.stdout_file()).await;
                processing.complete(payload, elapsed_ms(started))
            }
            RUNTIME_LIMIT_EXIT_CODE => {
                let payload = read_payload(&self.stdout_file()).await;
                processing.failed(RUNTIME_LIMIT_MESSAGE, payload, elapsed_ms(started))
            }
            code => {
                let payload = read_payload(&self.stderr_file()).await;
                processing.failed(
                    format!(
                        "Received non zero exit code: {} when running algorithm for task: {}",
                        code, self.id
                    ),
                    payload,
                    elapsed_ms(started),
                )
            }
        };
        debug!(
            "Task {} settled as {} in {} ms",
            self.id, result.status, result.wall_time
        );
        Ok(result)
    }

    /// Record the invocation for audit. Failure is logged only.
    async fn write_command_run_file(&self, cmd: &CommandSpec) {
        let line = self
            .command_runner
            .last_command()
            .unwrap_or_else(|| cmd.command_line());
        let path = self.command_run_file();
        if let Err(e) = fs::write(&path, format!("{}\n", line)).await {
            error!("Unable to write {}: {}", path.display(), e);
        }
    }
}

/// Parse a result file as JSON, falling back to its raw text.
/// A missing or unreadable file yields no payload.
async fn read_payload(path: &Path) -> Option<Value> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            debug!("No payload from {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Some(value),
        Err(_) => Some(Value::String(text)),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
