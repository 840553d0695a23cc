//! Replay job routes.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/api/jobs` | Add replay jobs |
//! | GET | `/api/jobs` | List all replay jobs |
//! | DELETE | `/api/jobs` | Stop and delete all jobs |
//! | DELETE | `/api/jobs/finished` | Delete jobs in a terminal state |
//! | DELETE | `/api/jobs/pending` | Delete jobs that have not started |
//! | DELETE | `/api/jobs/matching?pattern=` | Delete jobs whose name matches a regex |
//! | POST | `/api/jobs/{job_name}/start` | Trigger a replay waiting for its start flag |
//!
//! Mutating endpoints always answer `200 OK` with a [`ControlResponse`];
//! `success` tells whether the request was applied.

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    routing::{delete, get, post},
};

use crate::api::error::ApiResult;
use crate::api::models::{AddJobsRequest, DeleteMatchingQuery};
use crate::api::server::AppState;
use crate::control::ControlResponse;
use crate::domain::ReplayJob;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(list_jobs).post(add_jobs).delete(delete_all_jobs),
        )
        .route("/finished", delete(delete_finished_jobs))
        .route("/pending", delete(delete_pending_jobs))
        .route("/matching", delete(delete_matching_jobs))
        .route("/{job_name}/start", post(start_job))
}

/// `POST /api/jobs`
async fn add_jobs(
    State(state): State<AppState>,
    payload: Result<Json<AddJobsRequest>, JsonRejection>,
) -> ApiResult<Json<ControlResponse>> {
    let Json(request) = payload?;
    Ok(Json(state.control.add_replay_jobs(request.jobs).await))
}

/// `GET /api/jobs`
async fn list_jobs(State(state): State<AppState>) -> Json<Vec<ReplayJob>> {
    Json(state.control.get_all_replay_jobs().await)
}

/// `DELETE /api/jobs`
async fn delete_all_jobs(State(state): State<AppState>) -> Json<ControlResponse> {
    Json(state.control.delete_all_replay_jobs().await)
}

async fn delete_finished_jobs(State(state): State<AppState>) -> Json<ControlResponse> {
    Json(state.control.delete_finished_jobs().await)
}

async fn delete_pending_jobs(State(state): State<AppState>) -> Json<ControlResponse> {
    Json(state.control.delete_pending_jobs().await)
}

/// `DELETE /api/jobs/matching?pattern=drive-.*`
async fn delete_matching_jobs(
    State(state): State<AppState>,
    query: Result<Query<DeleteMatchingQuery>, QueryRejection>,
) -> ApiResult<Json<ControlResponse>> {
    let Query(query) = query?;
    Ok(Json(state.control.delete_replay_jobs(&query.pattern).await))
}

/// `POST /api/jobs/{job_name}/start`
async fn start_job(
    State(state): State<AppState>,
    Path(job_name): Path<String>,
) -> Json<ControlResponse> {
    Json(state.control.start_replay_job(&job_name).await)
}
