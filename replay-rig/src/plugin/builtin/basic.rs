//! Plugin that does nothing and finishes on the first poll.

use async_trait::async_trait;

use crate::domain::RunState;
use crate::plugin::{Handoff, PluginError, StageInput, StagePlugin, StepProgress};

pub const NAME: &str = "basic";

/// No-op plugin usable for every stage role.
#[derive(Debug, Default)]
pub struct BasicPlugin {
    started: bool,
}

impl BasicPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagePlugin for BasicPlugin {
    async fn start(&mut self, _input: &StageInput<'_>) -> Result<Handoff, PluginError> {
        self.started = true;
        Ok(Handoff::Object(Default::default()))
    }

    async fn get_progress(&mut self, progress: &mut StepProgress<'_>) -> Result<(), PluginError> {
        if !self.started {
            return Err(PluginError::failed("polled before start"));
        }
        progress.finish();
        Ok(())
    }

    async fn cleanup(&mut self, _final_state: RunState) -> Result<(), PluginError> {
        Ok(())
    }
}
