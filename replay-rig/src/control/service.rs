//! Request handling of the control surface.
//!
//! Every operation maps onto the [`JobStore`]; the transport only
//! (de)serializes. Mutating operations never fail at the Rust level: errors
//! and panics are logged and returned as a failed [`ControlResponse`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use start_flag::StartFlag;
use tracing::{debug, error, info};

use super::volume::{VolumeInfo, collect_volumes};
use crate::domain::{JobState, ReplayJob};
use crate::pipeline::{JobStore, panic_message};
use crate::{Error, Result};

/// Result of a mutating control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Control facade over the job store.
#[derive(Clone)]
pub struct ControlService {
    store: Arc<JobStore>,
    shm_dir: PathBuf,
}

impl ControlService {
    pub fn new(store: Arc<JobStore>) -> Self {
        let shm_dir = store.context().shm_dir.clone();
        Self { store, shm_dir }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Validate and enqueue jobs. One invalid job rejects the whole request.
    pub async fn add_replay_jobs(&self, jobs: Vec<ReplayJob>) -> ControlResponse {
        guarded("AddReplayJobs", async {
            info!("Adding {} new jobs", jobs.len());
            for job in &jobs {
                job.validate()?;
            }
            let added = self.store.add_jobs(jobs).await;
            info!("Adding jobs finished");
            Ok(format!("Added {added} replay jobs"))
        })
        .await
    }

    pub async fn get_all_job_states(&self) -> Vec<JobState> {
        self.store.all_states().await
    }

    pub async fn get_running_job_states(&self) -> Vec<JobState> {
        self.store.running_states().await
    }

    pub async fn get_running_replay_job_state(&self) -> Option<JobState> {
        self.store.running_replay_state().await
    }

    pub async fn get_all_replay_jobs(&self) -> Vec<ReplayJob> {
        self.store.all_jobs().await
    }

    pub async fn delete_all_replay_jobs(&self) -> ControlResponse {
        guarded("DeleteAllReplayJobs", async {
            let deleted = self.store.delete_all().await;
            Ok(format!("Deleted {deleted} replay jobs"))
        })
        .await
    }

    pub async fn delete_finished_jobs(&self) -> ControlResponse {
        guarded("DeleteFinishedJobs", async {
            let deleted = self.store.delete_finished().await;
            Ok(format!("Deleted {deleted} finished replay jobs"))
        })
        .await
    }

    pub async fn delete_pending_jobs(&self) -> ControlResponse {
        guarded("DeletePendingJobs", async {
            let deleted = self.store.delete_pending().await;
            Ok(format!("Deleted {deleted} pending replay jobs"))
        })
        .await
    }

    /// Delete every job whose whole name matches `pattern`.
    pub async fn delete_replay_jobs(&self, pattern: &str) -> ControlResponse {
        guarded("DeleteReplayJobs", async {
            if pattern.is_empty() {
                return Err(Error::validation("pattern must not be empty"));
            }
            let deleted = self.store.delete_matching(pattern).await?;
            Ok(format!("Deleted {deleted} replay jobs matching '{pattern}'"))
        })
        .await
    }

    /// Set the start flag of a replay waiting for its trigger.
    pub async fn start_replay_job(&self, job_name: &str) -> ControlResponse {
        guarded("StartReplayJob", async {
            info!(job = %job_name, "Starting replay job");
            let mut flag = StartFlag::open(&self.shm_dir, job_name)?;
            flag.trigger()?;
            debug!(segment = %flag.name(), "Start trigger set");
            Ok("OK.".to_string())
        })
        .await
    }

    pub async fn get_volume_info(&self) -> Vec<VolumeInfo> {
        match tokio::task::spawn_blocking(collect_volumes).await {
            Ok(volumes) => volumes,
            Err(e) => {
                error!(error = %e, "Collecting volume information failed");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for ControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlService")
            .field("shm_dir", &self.shm_dir)
            .finish_non_exhaustive()
    }
}

async fn guarded<F>(operation: &'static str, request: F) -> ControlResponse
where
    F: Future<Output = Result<String>>,
{
    debug!(operation, "Received request");
    match AssertUnwindSafe(request).catch_unwind().await {
        Ok(Ok(message)) => ControlResponse::ok(message),
        Ok(Err(e)) => {
            error!(operation, error = %e, "Request failed");
            ControlResponse::failure(e.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload);
            error!(operation, panic = %message, "Unexpected error occurred");
            ControlResponse::failure(format!("{operation} failed: {message}"))
        }
    }
}
