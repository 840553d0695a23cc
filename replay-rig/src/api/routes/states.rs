//! Job state routes.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/api/states` | States of all jobs |
//! | GET | `/api/states/running` | States of running jobs |
//! | GET | `/api/states/replay` | State of the job on the replay rig, or `null` |

use axum::{Json, Router, extract::State, routing::get};

use crate::api::server::AppState;
use crate::domain::JobState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(all_states))
        .route("/running", get(running_states))
        .route("/replay", get(running_replay_state))
}

async fn all_states(State(state): State<AppState>) -> Json<Vec<JobState>> {
    Json(state.control.get_all_job_states().await)
}

async fn running_states(State(state): State<AppState>) -> Json<Vec<JobState>> {
    Json(state.control.get_running_job_states().await)
}

async fn running_replay_state(State(state): State<AppState>) -> Json<Option<JobState>> {
    Json(state.control.get_running_replay_job_state().await)
}
