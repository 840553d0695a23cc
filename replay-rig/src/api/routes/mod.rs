//! API route modules.
//!
//! Organizes routes by resource type.

pub mod health;
pub mod jobs;
pub mod logging;
pub mod states;
pub mod system;

use axum::Router;
use axum::http::Uri;

use crate::api::error::ApiError;
use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/jobs", jobs::router())
        .nest("/api/states", states::router())
        .nest("/api/volumes", system::router())
        .nest("/api/logging", logging::router())
        .nest("/health", health::router())
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("No route for {}", uri.path()))
}
