//! REST API server module.
//!
//! Exposes the control service as HTTP JSON endpoints.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
