//! Runtime log filter routes.

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::get,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::LogFilterBody;
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_filter).put(set_filter))
}

/// `GET /api/logging` - current filter directive.
async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterBody>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging is not configured"))?;
    Ok(Json(LogFilterBody {
        filter: config.get_filter(),
    }))
}

/// `PUT /api/logging` - replace the filter directive.
async fn set_filter(
    State(state): State<AppState>,
    payload: Result<Json<LogFilterBody>, JsonRejection>,
) -> ApiResult<Json<LogFilterBody>> {
    let Json(body) = payload?;
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging is not configured"))?;
    config.set_filter(&body.filter)?;
    Ok(Json(LogFilterBody {
        filter: config.get_filter(),
    }))
}
