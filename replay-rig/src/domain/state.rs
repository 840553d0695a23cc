//! Run states, per-stage progress and the persisted job state.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use super::job::ReplayJob;
use crate::Error;

/// State of a job or of one of its stages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// The stage was skipped on purpose.
    NotExecuted,
    /// Waiting to be executed.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Completed cleanly.
    Finished,
    /// Failed.
    Error,
    /// Exceeded its time budget.
    Timeout,
    /// Cancelled after it had started.
    Aborted,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotExecuted => "NOT_EXECUTED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Terminal states for a job: nothing leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Error | Self::Timeout | Self::Aborted
        )
    }

    /// States a stage may still be moved out of by a failure.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Validate a transition of a job's overall state.
    ///
    /// Overall states only move forward: `PENDING -> RUNNING -> terminal`.
    /// `PENDING -> ERROR` is allowed for jobs rejected before any stage ran.
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;

        match (self, target) {
            (from, to) if *from == to => true,
            (Pending, Running | Error) => true,
            (Running, to) => to.is_terminal(),
            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: RunState) -> Result<RunState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

/// One of the three ordered phases of a replay job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Download,
    Replay,
    Upload,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Download, Stage::Replay, Stage::Upload];
}

/// Progress record of one stage of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub state: RunState,
    /// Percentage, 0..=100.
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress: f32,
    #[serde(default)]
    pub message: String,
    /// Seconds since the stage started running.
    #[serde(default, deserialize_with = "null_as_default")]
    pub elapsed_time: f64,
    /// Diagnostic key/value pairs reported by the plugin.
    #[serde(default)]
    pub user_data: BTreeMap<String, String>,
}

impl StepState {
    pub fn with_state(state: RunState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    /// Mark the stage failed unless it already carries a more specific
    /// terminal state. The message is only filled in when empty.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state.is_open() {
            self.state = RunState::Error;
        }
        if self.message.is_empty() {
            self.message = message.into();
        }
    }

    /// Replace non-finite numbers, which JSON cannot represent.
    pub fn normalize(&mut self) {
        if !self.progress.is_finite() {
            self.progress = if self.progress == f32::INFINITY { 100.0 } else { 0.0 };
        }
        if !self.elapsed_time.is_finite() {
            self.elapsed_time = 0.0;
        }
    }
}

/// Older queue files may hold `null` where a number was not finite.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Mutable state of a queued job; the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub overall_state: RunState,
    pub download_state: StepState,
    pub replay_state: StepState,
    pub upload_state: StepState,
    /// Copy of the originating job so a persisted queue is self-contained.
    pub current_job: ReplayJob,
}

impl JobState {
    /// Fresh state for a newly admitted job.
    pub fn new(job: ReplayJob) -> Self {
        Self {
            overall_state: RunState::Pending,
            download_state: StepState::default(),
            replay_state: StepState::default(),
            upload_state: StepState::default(),
            current_job: job,
        }
    }

    pub fn stage(&self, stage: Stage) -> &StepState {
        match stage {
            Stage::Download => &self.download_state,
            Stage::Replay => &self.replay_state,
            Stage::Upload => &self.upload_state,
        }
    }

    pub fn stage_mut(&mut self, stage: Stage) -> &mut StepState {
        match stage {
            Stage::Download => &mut self.download_state,
            Stage::Replay => &mut self.replay_state,
            Stage::Upload => &mut self.upload_state,
        }
    }

    /// Move the overall state forward, rejecting backwards moves.
    pub fn advance(&mut self, target: RunState) -> Result<(), Error> {
        self.overall_state = self.overall_state.transition_to(target)?;
        Ok(())
    }

    /// Normalize every stage for storage.
    pub fn normalize(&mut self) {
        for stage in Stage::ALL {
            self.stage_mut(stage).normalize();
        }
    }

    /// Rewrite a state found `RUNNING` at startup to `ERROR`.
    ///
    /// Returns whether the state was rewritten.
    pub fn recover_after_crash(&mut self) -> bool {
        if self.overall_state == RunState::Running {
            self.overall_state = RunState::Error;
            true
        } else {
            false
        }
    }

    /// Overall outcome of a job whose stages all ran without error.
    pub fn settled_state(&self) -> RunState {
        let stages = [&self.download_state, &self.replay_state, &self.upload_state];

        if stages.iter().any(|s| s.state == RunState::Error) {
            RunState::Error
        } else if stages.iter().any(|s| s.state == RunState::Aborted) {
            RunState::Aborted
        } else if stages.iter().any(|s| s.state == RunState::Timeout) {
            RunState::Timeout
        } else {
            RunState::Finished
        }
    }
}
