//! Plugin resolution and stage failure errors.

use thiserror::Error;

use crate::domain::RunState;

/// Errors raised while resolving or running a stage plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The reference does not name a registered plugin or an existing file.
    #[error("Plugin '{0}' not found")]
    NotFound(String),

    /// The reference resolved, but it cannot produce a plugin for the stage.
    #[error("Plugin '{reference}' is malformed: {reason}")]
    Malformed { reference: String, reason: String },

    /// The plugin ended its stage with an explicit state.
    #[error("Stage ended with {state}: {message}")]
    Step { state: RunState, message: String },

    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn step(state: RunState, message: impl Into<String>) -> Self {
        Self::Step {
            state,
            message: message.into(),
        }
    }

    pub fn malformed(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}
