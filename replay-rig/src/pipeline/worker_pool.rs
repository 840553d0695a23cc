//! Worker pool running job executors as concurrent tasks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::executor::{ExecutionOutcome, JobExecutor};

/// How a job task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The executor returned normally.
    Finished(ExecutionOutcome),
    /// The executor panicked; carries the panic message.
    Panicked(String),
}

/// Reacts to the end of a job task.
///
/// Not invoked for tasks cancelled before they started.
pub trait CompletionHandler: Send + 'static {
    fn on_complete(self: Box<Self>, outcome: TaskOutcome);
}

/// Handle of one submitted job task.
#[derive(Debug, Clone)]
pub struct JobHandle {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl JobHandle {
    /// Cancel the task if it has not started executing yet. A running
    /// executor is only stopped through its own stop flag.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait until the task has ended, whether it ran, was cancelled or
    /// panicked.
    pub async fn wait(&self) {
        self.done.cancelled().await
    }
}

/// A bounded pool of execution slots.
pub struct WorkerPool {
    max_workers: usize,
    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        info!("Using {} workers", max_workers);
        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Schedule an executor. It runs once a slot is free.
    pub fn submit(
        &self,
        executor: Arc<JobExecutor>,
        handler: Box<dyn CompletionHandler>,
    ) -> JobHandle {
        let handle = JobHandle {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        };

        let cancel = handle.cancel.clone();
        let done = handle.done.clone();
        let semaphore = self.semaphore.clone();
        let pool_token = self.cancellation_token.clone();
        let active_workers = self.active_workers.clone();

        let task = async move {
            let _done = done.drop_guard();

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(job = %executor.job().job_name, "Job task cancelled before start");
                    return;
                }
                _ = pool_token.cancelled() => return,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            if cancel.is_cancelled() {
                return;
            }

            active_workers.fetch_add(1, Ordering::SeqCst);
            let result = AssertUnwindSafe(executor.execute()).catch_unwind().await;
            active_workers.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            let outcome = match result {
                Ok(outcome) => TaskOutcome::Finished(outcome),
                Err(payload) => {
                    let message = panic_message(payload);
                    error!(job = %executor.job().job_name, panic = %message, "Unhandled panic in job");
                    TaskOutcome::Panicked(message)
                }
            };
            handler.on_complete(outcome);
        };

        let mut tasks = self.tasks.lock();
        match tasks.as_mut() {
            Some(join_set) => {
                // Reap finished tasks so the set only tracks live ones.
                while join_set.try_join_next().is_some() {}
                join_set.spawn(task);
            }
            None => {
                debug!("Worker pool stopped, job will not run");
                handle.cancel.cancel();
                handle.done.cancel();
            }
        }

        handle
    }

    /// Stop the pool: pending tasks are dropped, running ones awaited.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    /// Number of executors currently running.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
