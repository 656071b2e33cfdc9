//! Task engine - Admission, lifecycle and reconciliation of tasks
//!
//! This module provides:
//! - `TaskEngine`: the public lifecycle operations (request, get_result,
//!   get_status, delete, get_server_status, get_algorithms, shutdown)
//! - The reconciliation loop that moves settled tasks from the live registry
//!   into the result store and maintains the aggregate counters
//! - `EngineFactory`: builds an engine from `ServiceConfig`
//!
//! The engine module does NOT:
//! - Launch processes itself (see `runner`)
//! - Know about HTTP (see `http`)

pub mod factory;

pub use factory::EngineFactory;

use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::algorithms::{AlgorithmSet, ServiceMetaData};
use crate::core::status::OK_STATUS;
use crate::core::{now_ms, ServerStatus, TaskRequest, TaskResult, TaskStatusView};
use crate::error::EngineError;
use crate::pool::{TaskHandle, WorkerPool};
use crate::runner::{ContainerTaskRunner, RunnerSettings, TaskCancelled};
use crate::store::ResultStore;
use crate::validator::{RequestValidator, SchemaValidator};

/// Default pause between reconciliation passes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type LiveTask = TaskHandle<Result<TaskResult, TaskCancelled>>;

/// In-process task engine backed by a fixed worker pool
pub struct TaskEngine {
    settings: RunnerSettings,
    algorithms: Option<AlgorithmSet>,
    metadata: Option<ServiceMetaData>,
    validator: Box<dyn RequestValidator>,
    pool: WorkerPool,
    live: DashMap<String, LiveTask>,
    store: ResultStore,
    poll_interval: Duration,
    queued_tasks: AtomicUsize,
    completed_tasks: AtomicUsize,
    canceled_tasks: AtomicUsize,
    shutdown: CancellationToken,
}

impl TaskEngine {
    pub fn new(settings: RunnerSettings, pool: WorkerPool, algorithms: Option<AlgorithmSet>) -> Self {
        let store = ResultStore::new(settings.task_dir.clone());
        Self {
            settings,
            algorithms,
            metadata: None,
            validator: Box::new(SchemaValidator::new()),
            pool,
            live: DashMap::new(),
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
            queued_tasks: AtomicUsize::new(0),
            completed_tasks: AtomicUsize::new(0),
            canceled_tasks: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_validator(mut self, validator: Box<dyn RequestValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_metadata(mut self, metadata: ServiceMetaData) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn metadata(&self) -> Option<&ServiceMetaData> {
        self.metadata.as_ref()
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Validate and admit a request, returning the new task id immediately
    pub async fn request(&self, request: Option<TaskRequest>) -> Result<String, EngineError> {
        let request = request.ok_or_else(|| bad_request("Request is null"))?;
        let name = request
            .algorithm
            .as_deref()
            .ok_or_else(|| bad_request("No algorithm specified"))?;
        if request.data.is_none() {
            return Err(bad_request("data is null"));
        }
        let algorithms = self.algorithms.as_ref().ok_or_else(|| {
            EngineError::Internal("No algorithms are available to run in service".to_string())
        })?;
        let algorithm = algorithms
            .get(name)
            .ok_or_else(|| bad_request(format!("{} is not a valid algorithm", name)))?;
        self.validator
            .validate(algorithm, &request)
            .map_err(|e| bad_request(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let start_time = now_ms();
        self.store.insert(TaskResult::submitted(&id, start_time));

        let runner = match ContainerTaskRunner::new(
            &self.settings,
            &id,
            &algorithm.docker_image,
            &request,
            start_time,
        )
        .await
        {
            Ok(runner) => runner.with_result_store(self.store.clone()),
            Err(e) => {
                self.store.remove(&id);
                return Err(e);
            }
        };

        let handle = match self
            .pool
            .submit(move |cancel| async move { runner.call(&cancel).await })
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Rejected task {}: {}", id, e);
                self.store.remove(&id);
                remove_task_dir(&self.store.task_path(&id)).await;
                return Err(EngineError::Transient(e.to_string()));
            }
        };
        self.live.insert(id.clone(), handle);

        info!("Submitted task {} for algorithm {}", id, name);
        Ok(id)
    }

    /// Full result of a task, including its payload once settled
    pub async fn get_result(&self, id: &str) -> Result<TaskResult, EngineError> {
        let id = require_id(id, "Id is null")?;
        self.store
            .get(id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("No task with id of {} found", id)))
    }

    /// Status projection without the output payload
    pub async fn get_status(&self, id: &str) -> Result<TaskStatusView, EngineError> {
        self.get_result(id).await.map(|r| TaskStatusView::from(&r))
    }

    /// Cancel a task if it is in flight and remove everything it left behind.
    /// Deleting an unknown id succeeds.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let id = require_id(id, "id is null")?;
        debug!("Deleting task {}", id);
        self.store.remove(id);

        let finished = match self.live.get(id) {
            Some(handle) => {
                let cancelled = handle.cancel();
                info!("Canceling task: {} result of cancel(): {}", id, cancelled);
                !cancelled && handle.is_finished()
            }
            None => false,
        };
        if finished {
            // settled but not yet flushed; its directory is about to go
            self.live.remove(id);
        }

        remove_task_dir(&self.store.task_path(id)).await;
        Ok(())
    }

    pub fn get_server_status(&self) -> Result<ServerStatus, EngineError> {
        let status = self.server_status().map_err(|e| {
            error!("ServerStatus error: {:#}", e);
            EngineError::Internal(format!("Exception raised when getting ServerStatus: {}", e))
        })?;
        log_server_status(&status);
        Ok(status)
    }

    fn server_status(&self) -> anyhow::Result<ServerStatus> {
        Ok(ServerStatus {
            status: OK_STATUS.to_string(),
            rest_version: env!("CARGO_PKG_VERSION").to_string(),
            load: load_average(),
            pc_disk_full: disk_full_percent(self.store.task_dir())?,
            queued_tasks: self.queued_tasks.load(Ordering::SeqCst),
            completed_tasks: self.completed_tasks.load(Ordering::SeqCst),
            canceled_tasks: self.canceled_tasks.load(Ordering::SeqCst),
        })
    }

    pub fn get_algorithms(&self) -> Result<AlgorithmSet, EngineError> {
        self.algorithms
            .clone()
            .ok_or_else(|| EngineError::Internal("No algorithms found".to_string()))
    }

    /// Stop the reconciliation loop after its current pass and refuse new
    /// work. In-flight tasks are not interrupted.
    pub fn shutdown(&self) {
        info!("Shutting down task engine");
        self.shutdown.cancel();
        self.pool.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// One pass over the live registry.
    ///
    /// Cancelled tasks are dropped, finished tasks are persisted and dropped,
    /// everything else counts as queued.
    pub async fn reconcile(&self) {
        let mut queued = 0;
        let mut settled = Vec::new();
        for entry in self.live.iter() {
            let handle = entry.value();
            if handle.is_cancelled() || handle.is_finished() {
                settled.push(entry.key().clone());
            } else {
                queued += 1;
            }
        }

        for id in settled {
            // delete() may have dropped it in the meantime
            let Some((_, handle)) = self.live.remove(&id) else {
                continue;
            };
            if handle.is_cancelled() {
                self.canceled_tasks.fetch_add(1, Ordering::SeqCst);
                debug!("Dropped cancelled task {}", id);
                continue;
            }
            debug!("Found a completed or failed task");
            self.settle(&id, handle).await;
        }

        self.queued_tasks.store(queued, Ordering::SeqCst);
    }

    async fn settle(&self, id: &str, handle: LiveTask) {
        match handle.join().await {
            Ok(Some(Ok(result))) => {
                debug!(
                    "Task {} settled: status={}, progress={}, wall_time={}ms",
                    id, result.status, result.progress, result.wall_time
                );
                match self.store.save(&result).await {
                    Ok(()) => {
                        self.completed_tasks.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => error!("Failed to persist result of task {}: {:#}", id, e),
                }
            }
            Ok(Some(Err(cancelled))) => {
                debug!("{}", cancelled);
                self.canceled_tasks.fetch_add(1, Ordering::SeqCst);
            }
            Ok(None) => {
                self.canceled_tasks.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                error!("Got execution fault for task {}: {}", id, e);
                self.store.remove(id);
            }
        }
    }

    /// Reconcile until `shutdown` is called
    pub async fn run(&self) {
        info!(
            "Reconciliation loop started with {} worker(s), polling every {:?}",
            self.pool.size(),
            self.poll_interval
        );
        while !self.shutdown.is_cancelled() {
            self.reconcile().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        debug!("Shutdown was invoked");
        if let Ok(status) = self.server_status() {
            log_server_status(&status);
        }
    }

    /// Spawn the reconciliation loop on the runtime
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run().await })
    }
}

fn bad_request(message: impl Into<String>) -> EngineError {
    EngineError::BadRequest(message.into())
}

fn require_id<'a>(id: &'a str, message: &str) -> Result<&'a str, EngineError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(bad_request(message));
    }
    Ok(id)
}

async fn remove_task_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(
            "There was a problem deleting the directory {}: {}",
            dir.display(),
            e
        ),
    }
}

fn log_server_status(status: &ServerStatus) {
    match serde_json::to_string(status) {
        Ok(json) => info!("ServerStatus: {}", json),
        Err(e) => error!("error trying to log server status: {}", e),
    }
}

/// 1, 5 and 15 minute load averages; -1 where unavailable
fn load_average() -> Vec<f32> {
    let mut load = vec![-1.0; 3];
    if let Ok(content) = std::fs::read_to_string("/proc/loadavg") {
        for (slot, field) in load.iter_mut().zip(content.split_whitespace()) {
            if let Ok(value) = field.parse::<f32>() {
                *slot = value;
            }
        }
    }
    load
}

fn disk_full_percent(dir: &Path) -> anyhow::Result<i32> {
    use anyhow::Context;
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(dir).with_context(|| format!("statvfs {}", dir.display()))?;
    let total = stat.blocks() as f64 * stat.fragment_size() as f64;
    if total <= 0.0 {
        return Ok(0);
    }
    let free = stat.blocks_free() as f64 * stat.fragment_size() as f64;
    Ok(100 - ((free / total) * 100.0).round() as i32)
}
