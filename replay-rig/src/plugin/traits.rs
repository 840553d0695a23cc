//! Stage plugin trait and the types passed across it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::PluginError;
use crate::diagram::{DiagramEngine, LogCallback};
use crate::domain::{ReplayJob, RunState, Stage, StepState};

/// Opaque value returned by the download plugin's `start` and handed to the
/// replay plugin's `start`.
pub type Handoff = serde_json::Value;

/// Everything a plugin factory gets to build one plugin instance.
#[derive(Clone)]
pub struct PluginContext {
    pub job_name: String,
    pub stage: Stage,
    /// The engine, for replay plugins only.
    pub diagram: Option<Arc<dyn DiagramEngine>>,
    /// Resolved file path when the plugin was referenced by path.
    pub plugin_path: Option<PathBuf>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("job_name", &self.job_name)
            .field("stage", &self.stage)
            .field("diagram", &self.diagram.is_some())
            .field("plugin_path", &self.plugin_path)
            .finish()
    }
}

/// Input of a plugin's `start`.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub job: &'a ReplayJob,
    pub stage: Stage,
    /// Download handoff, replay stage only.
    pub handoff: Option<&'a Handoff>,
}

impl<'a> StageInput<'a> {
    pub fn replay_data(&self) -> &'a BTreeMap<String, String> {
        &self.job.replay_data
    }

    pub fn log_files(&self) -> &'a BTreeMap<String, String> {
        &self.job.log_files
    }
}

/// Progress sink handed to `get_progress`.
///
/// Borrows the executor's step state for one call only.
pub struct StepProgress<'a> {
    step: &'a mut StepState,
}

impl<'a> StepProgress<'a> {
    pub fn new(step: &'a mut StepState) -> Self {
        Self { step }
    }

    pub fn state(&self) -> RunState {
        self.step.state
    }

    pub fn set_state(&mut self, state: RunState) {
        self.step.state = state;
    }

    /// Set the progress percentage, clamped to `0..=100`. NaN reads as 0.
    pub fn set_progress(&mut self, progress: f32) {
        self.step.progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.step.message = message.into();
    }

    pub fn set_user_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.step.user_data.insert(key.into(), value.into());
    }

    /// Mark the stage finished at 100%.
    pub fn finish(&mut self) {
        self.step.progress = 100.0;
        self.step.state = RunState::Finished;
    }

    /// Mark the stage failed with a message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.step.state = RunState::Error;
        self.step.message = message.into();
    }
}

/// A download, replay or upload plugin.
///
/// One instance serves exactly one stage of one job execution.
#[async_trait]
pub trait StagePlugin: Send + Sync {
    /// Start the stage. Must return promptly; the actual work runs in the
    /// background and is observed through `get_progress`.
    async fn start(&mut self, input: &StageInput<'_>) -> Result<Handoff, PluginError>;

    /// Report the current progress. Called once per poll interval while the
    /// stage is running. Setting a state other than `RUNNING` ends the stage.
    async fn get_progress(&mut self, progress: &mut StepProgress<'_>) -> Result<(), PluginError>;

    /// Release resources. Always called once the stage ends, with its final
    /// state.
    async fn cleanup(&mut self, final_state: RunState) -> Result<(), PluginError>;

    /// Callback for diagram engine reports, replay plugins only.
    fn log_callback(&self) -> Option<LogCallback> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_progress_setters() {
        let mut step = StepState::with_state(RunState::Running);
        {
            let mut progress = StepProgress::new(&mut step);
            progress.set_progress(150.0);
            progress.set_message("copying");
            progress.set_user_data("files", "3");
            assert_eq!(progress.state(), RunState::Running);
        }
        assert_eq!(step.progress, 100.0);
        assert_eq!(step.message, "copying");
        assert_eq!(step.user_data.get("files").map(String::as_str), Some("3"));

        StepProgress::new(&mut step).set_progress(f32::NAN);
        assert_eq!(step.progress, 0.0);
        StepProgress::new(&mut step).set_progress(f32::NEG_INFINITY);
        assert_eq!(step.progress, 0.0);

        StepProgress::new(&mut step).fail("disk full");
        assert_eq!(step.state, RunState::Error);
        assert_eq!(step.message, "disk full");
    }

    #[test]
    fn test_stage_input_accessors() {
        let job = ReplayJob::new("job", "/d.rtd")
            .with_replay_data("key", "value")
            .with_log_file("trace", "/logs/trace.log");
        let handoff = serde_json::json!({"files": 2});
        let input = StageInput {
            job: &job,
            stage: Stage::Replay,
            handoff: Some(&handoff),
        };

        assert_eq!(input.replay_data().get("key").map(String::as_str), Some("value"));
        assert_eq!(input.log_files().len(), 1);
        assert_eq!(input.handoff, Some(&handoff));
    }
}
