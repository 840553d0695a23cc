//! API request and response models.

use serde::{Deserialize, Serialize};

use crate::domain::ReplayJob;

/// Body of `POST /api/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddJobsRequest {
    pub jobs: Vec<ReplayJob>,
}

/// Query of `DELETE /api/jobs/matching`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMatchingQuery {
    /// Regular expression matched against the whole job name.
    pub pattern: String,
}

/// Body of `GET` and `PUT /api/logging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilterBody {
    /// `tracing` filter directive, e.g. `replay_rig=info`.
    pub filter: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Number of queued jobs, in any state.
    pub jobs: usize,
}
