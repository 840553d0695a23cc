//! replay-rig library crate.
//!
//! Schedules hardware-in-the-loop replay jobs through download, replay and
//! upload stages and exposes the queue through a control API.

pub mod api;
pub mod config;
pub mod control;
pub mod diagram;
pub mod domain;
pub mod error;
pub mod logging;
pub mod panic_hook;
pub mod pipeline;
pub mod plugin;
pub mod utils;

pub use error::{Error, Result};
