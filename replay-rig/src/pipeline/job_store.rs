//! The ordered queue of admitted jobs.
//!
//! Every structural change and every consistent read goes through one coarse
//! lock. Job states themselves are written only by their executors; readers
//! copy them under the store lock.

use std::sync::{Arc, Weak};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{ExecutionContext, ExecutionOutcome, JobExecutor};
use super::persistence::{PersistedJob, QueueRepository};
use super::worker_pool::{CompletionHandler, JobHandle, TaskOutcome, WorkerPool};
use crate::domain::{JobState, ReplayJob, RunState};
use crate::Result;

/// Runtime-only entry of one admitted job.
struct QueuedJobEntry {
    job: ReplayJob,
    executor: Arc<JobExecutor>,
    handle: JobHandle,
}

impl QueuedJobEntry {
    fn state(&self) -> JobState {
        self.executor.snapshot()
    }

    /// Stop the executor and cancel its task if it has not started.
    fn stop(&self) {
        self.executor.stop();
        self.handle.cancel();
    }
}

/// Persists the queue after a job task ended.
struct JobCompletion {
    job_name: String,
    executor: Arc<JobExecutor>,
    store: Weak<JobStore>,
}

impl CompletionHandler for JobCompletion {
    fn on_complete(self: Box<Self>, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Finished(ExecutionOutcome::NotExecuted) => {
                debug!(job = %self.job_name, "Job was not executed");
                return;
            }
            TaskOutcome::Finished(ExecutionOutcome::Executed) => {
                let state = self.executor.snapshot().overall_state;
                debug!(job = %self.job_name, state = %state, "Job finished with state {}", state);
            }
            TaskOutcome::Panicked(message) => {
                error!(job = %self.job_name, "Unhandled exception in job: {}", message);
                self.executor.force_error(&message);
            }
        }

        // Persisting needs the store lock, which a bulk delete may hold while
        // it waits for this very task to end.
        if let Some(store) = self.store.upgrade() {
            tokio::spawn(async move { store.persist().await });
        }
    }
}

/// The job queue.
pub struct JobStore {
    entries: Mutex<Vec<QueuedJobEntry>>,
    pool: WorkerPool,
    context: Arc<ExecutionContext>,
    repository: Option<Arc<dyn QueueRepository>>,
    self_ref: Weak<JobStore>,
}

impl JobStore {
    /// Create an empty store. Without a repository nothing is persisted.
    pub fn new(
        context: Arc<ExecutionContext>,
        repository: Option<Arc<dyn QueueRepository>>,
    ) -> Arc<Self> {
        let widths = context.gates.widths();
        info!(
            "Using {} workers with {} simultaneous downloads and {} simultaneous uploads",
            widths.overall, widths.download, widths.upload
        );

        Arc::new_cyclic(|self_ref| Self {
            entries: Mutex::new(Vec::new()),
            pool: WorkerPool::new(widths.overall),
            context,
            repository,
            self_ref: self_ref.clone(),
        })
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// Load the persisted queue and re-admit it.
    ///
    /// Jobs found `RUNNING` are rewritten to `ERROR` and never run again.
    /// A missing or unreadable queue leaves the store empty.
    pub async fn recover(&self) -> usize {
        let Some(repository) = &self.repository else {
            return 0;
        };

        let jobs = match repository.load().await {
            Ok(Some(jobs)) => jobs,
            Ok(None) => {
                info!(
                    "Found no existing queue at {}, starting with empty queue",
                    repository.location()
                );
                return 0;
            }
            Err(e) => {
                error!(
                    "Loading jobs from {} failed: {}, starting with empty queue",
                    repository.location(),
                    e
                );
                return 0;
            }
        };

        let mut entries = self.entries.lock().await;
        let count = jobs.len();
        for PersistedJob { job, mut state } in jobs {
            state.current_job = job;
            if state.recover_after_crash() {
                info!(
                    job = %state.current_job.job_name,
                    "Job was in state RUNNING, discarding with state ERROR"
                );
            }
            self.admit(&mut entries, state);
        }
        info!("Loaded {} jobs from {}", count, repository.location());

        self.persist_locked(&entries).await;
        count
    }

    /// Admit new jobs in order. Returns the number admitted.
    pub async fn add_jobs(&self, jobs: Vec<ReplayJob>) -> usize {
        let mut entries = self.entries.lock().await;
        let count = jobs.len();
        for job in jobs {
            self.admit(&mut entries, JobState::new(job));
        }
        self.persist_locked(&entries).await;
        count
    }

    fn admit(&self, entries: &mut Vec<QueuedJobEntry>, state: JobState) -> Uuid {
        let job = state.current_job.clone();
        if entries.iter().any(|e| e.job.job_name == job.job_name) {
            warn!(job = %job.job_name, "Another queued job has the same name");
        }

        let executor = Arc::new(JobExecutor::new(state, self.context.clone()));
        let handler = Box::new(JobCompletion {
            job_name: job.job_name.clone(),
            executor: executor.clone(),
            store: self.self_ref.clone(),
        });
        let handle = self.pool.submit(executor.clone(), handler);
        let id = executor.id();

        debug!(job = %job.job_name, id = %id, "Job queued");
        entries.push(QueuedJobEntry {
            job,
            executor,
            handle,
        });
        id
    }

    /// Stop and remove every job, waiting for running executors to settle.
    pub async fn delete_all(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();

        Self::stop_and_wait(&entries).await;
        entries.clear();
        info!("Deleted {} replay jobs", count);

        self.persist_locked(&entries).await;
        count
    }

    /// Remove jobs in a terminal state.
    pub async fn delete_finished(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();

        entries.retain(|e| !e.state().overall_state.is_terminal());
        let removed = before - entries.len();
        info!(
            "Deleted {} finished replay jobs, {} jobs remaining",
            removed,
            entries.len()
        );

        self.persist_locked(&entries).await;
        removed
    }

    /// Remove jobs that have not started yet.
    pub async fn delete_pending(&self) -> usize {
        let mut entries = self.entries.lock().await;

        let (removed, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.state().overall_state == RunState::Pending);
        *entries = kept;
        for entry in &removed {
            entry.stop();
        }
        info!(
            "Deleted {} pending replay jobs, {} jobs remaining",
            removed.len(),
            entries.len()
        );

        self.persist_locked(&entries).await;
        removed.len()
    }

    /// Stop and remove every job whose whole name matches `pattern`.
    ///
    /// Names are not unique, so one pattern may remove several jobs.
    pub async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))?;

        let mut entries = self.entries.lock().await;
        let (removed, kept): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| regex.is_match(&e.job.job_name));
        *entries = kept;
        for entry in &removed {
            entry.stop();
        }
        info!(
            "Deleted {} replay jobs with regex {}, {} jobs remaining",
            removed.len(),
            pattern,
            entries.len()
        );

        self.persist_locked(&entries).await;
        Ok(removed.len())
    }

    /// Stop every job, wait for them to settle and persist the final queue.
    pub async fn shutdown(&self) {
        {
            let entries = self.entries.lock().await;
            info!("Stopping execution");
            Self::stop_and_wait(&entries).await;

            info!("Serializing jobs");
            self.persist_locked(&entries).await;
        }
        self.pool.stop().await;
    }

    async fn stop_and_wait(entries: &[QueuedJobEntry]) {
        for entry in entries {
            entry.stop();
        }
        for entry in entries {
            entry.handle.wait().await;
        }
    }

    /// States of all jobs, in queue order.
    pub async fn all_states(&self) -> Vec<JobState> {
        let entries = self.entries.lock().await;
        entries.iter().map(QueuedJobEntry::state).collect()
    }

    /// States of jobs whose overall state is `RUNNING`.
    pub async fn running_states(&self) -> Vec<JobState> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(QueuedJobEntry::state)
            .filter(|s| s.overall_state == RunState::Running)
            .collect()
    }

    /// The job currently on the replay rig, if any.
    ///
    /// With a single worker this is the running job; otherwise the first job
    /// whose replay stage is running.
    pub async fn running_replay_state(&self) -> Option<JobState> {
        let serial = self.context.gates.widths().is_serial();
        let entries = self.entries.lock().await;
        entries.iter().map(QueuedJobEntry::state).find(|s| {
            if serial {
                s.overall_state == RunState::Running
            } else {
                s.replay_state.state == RunState::Running
            }
        })
    }

    /// Definitions of all jobs, in queue order.
    pub async fn all_jobs(&self) -> Vec<ReplayJob> {
        let entries = self.entries.lock().await;
        entries.iter().map(|e| e.job.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Write the current queue to the repository, if one is configured.
    pub async fn persist(&self) {
        let entries = self.entries.lock().await;
        self.persist_locked(&entries).await;
    }

    async fn persist_locked(&self, entries: &[QueuedJobEntry]) {
        let Some(repository) = &self.repository else {
            return;
        };

        let jobs: Vec<PersistedJob> = entries
            .iter()
            .map(|e| PersistedJob {
                job: e.job.clone(),
                state: e.state(),
            })
            .collect();

        if let Err(e) = repository.save(&jobs).await {
            error!("Serializing jobs to {} failed: {}", repository.location(), e);
        }
    }
}
