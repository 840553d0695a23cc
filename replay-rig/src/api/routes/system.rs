//! Host information routes.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::server::AppState;
use crate::control::VolumeInfo;

/// Create the volume router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(volume_info))
}

/// `GET /api/volumes` - size and free space of the data volumes.
async fn volume_info(State(state): State<AppState>) -> Json<Vec<VolumeInfo>> {
    Json(state.control.get_volume_info().await)
}
