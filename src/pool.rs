//! Fixed-size worker pool
//!
//! Every submitted unit of work is spawned immediately but only runs once it
//! holds one of `size` semaphore permits. Each gets its own cancellation
//! token; the unit of work is expected to watch it while blocked.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why the pool refused a submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Worker pool is shut down and not accepting tasks")]
    ShutDown,
    #[error("Worker pool is saturated with {0} outstanding tasks")]
    Saturated(usize),
}

/// Pool of `size` workers with an optional cap on outstanding tasks
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    max_queued: usize,
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    accepting: AtomicBool,
}

impl WorkerPool {
    /// `max_queued == 0` means no cap
    pub fn new(size: usize, max_queued: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            max_queued,
            permits: Arc::new(Semaphore::new(size)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks submitted and not yet finished, running or waiting
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    pub fn submit<F, Fut>(&self, work: F) -> Result<TaskHandle<Fut::Output>, PoolError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        if self.is_shutdown() {
            return Err(PoolError::ShutDown);
        }
        let previous = self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.max_queued > 0 && previous >= self.max_queued {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::Saturated(previous));
        }
        let guard = OutstandingGuard(self.outstanding.clone());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let permits = self.permits.clone();
        let join = tokio::spawn(async move {
            let _guard = guard;
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Task cancelled while waiting for a worker");
                    return None;
                }
                permit = permits.acquire_owned() => permit.ok()?,
            };
            Some(work(token).await)
        });

        Ok(TaskHandle { cancel, join })
    }

    /// Stop accepting new work. Running and waiting tasks are left alone.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

struct OutstandingGuard(Arc<AtomicUsize>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to one submitted unit of work
#[derive(Debug)]
pub struct TaskHandle<T> {
    cancel: CancellationToken,
    join: JoinHandle<Option<T>>,
}

impl<T> TaskHandle<T> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request cancellation. Returns false if the task already finished or
    /// was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.is_finished() || self.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Wait for the task. `Ok(None)` means it was cancelled before it got a
    /// worker; `Err` means the unit of work panicked.
    pub async fn join(self) -> Result<Option<T>, JoinError> {
        self.join.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_runs_work_to_completion() {
        let pool = WorkerPool::new(2, 0);
        let handle = assert_ok!(pool.submit(|_| async { 42 }));
        assert_eq!(handle.join().await.unwrap(), Some(42));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_limits_concurrency_to_size() {
        let pool = WorkerPool::new(2, 0);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.submit(move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.join().await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_worker() {
        let pool = WorkerPool::new(1, 0);
        let (release, wait) = oneshot::channel::<()>();
        let blocker = pool
            .submit(|_| async move {
                let _ = wait.await;
            })
            .unwrap();
        let queued = pool.submit(|_| async { "ran" }).unwrap();

        assert!(queued.cancel());
        assert!(queued.is_cancelled());
        assert!(!queued.cancel());
        assert_eq!(queued.join().await.unwrap(), None);

        release.send(()).unwrap();
        assert_eq!(blocker.join().await.unwrap(), Some(()));
    }

    #[tokio::test]
    async fn test_running_work_observes_token() {
        let pool = WorkerPool::new(1, 0);
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let handle = pool
            .submit(|token| async move {
                let _ = started_tx.send(());
                token.cancelled().await;
                "stopped"
            })
            .unwrap();

        started_rx.await.unwrap();
        assert!(handle.cancel());
        assert_eq!(handle.join().await.unwrap(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_refused() {
        let pool = WorkerPool::new(1, 0);
        let handle = pool.submit(|_| async {}).unwrap();
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_saturation_rejects_submission() {
        let pool = WorkerPool::new(1, 2);
        let (release, wait) = oneshot::channel::<()>();
        let first = pool
            .submit(|_| async move {
                let _ = wait.await;
            })
            .unwrap();
        let second = pool.submit(|_| async {}).unwrap();

        let err = assert_err!(pool.submit(|_| async {}));
        assert_eq!(err, PoolError::Saturated(2));

        release.send(()).unwrap();
        first.join().await.unwrap();
        second.join().await.unwrap();
        assert_ok!(pool.submit(|_| async {}));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work_only() {
        let pool = WorkerPool::new(1, 0);
        let (release, wait) = oneshot::channel::<()>();
        let running = pool
            .submit(|_| async move {
                let _ = wait.await;
                1
            })
            .unwrap();

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(
            pool.submit(|_| async { 2 }).unwrap_err(),
            PoolError::ShutDown
        );

        release.send(()).unwrap();
        assert_eq!(running.join().await.unwrap(), Some(1));
    }
}
