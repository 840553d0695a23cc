//! Poll protocol shared by the download, replay and upload stages.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Duration;

use futures::FutureExt;
use start_flag::StartFlag;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::{ExecutionContext, SharedJobState};
use super::worker_pool::panic_message;
use crate::domain::{ReplayJob, RunState, Stage, StepState};
use crate::plugin::{Handoff, PluginContext, PluginError, StageInput, StagePlugin, StepProgress};
use crate::{Error, Result};

/// Message shown while a replay waits for its external start trigger.
pub const WAITING_FOR_TRIGGER: &str = "waiting for start trigger";

/// Run one stage of a job to completion.
///
/// The stage's step state is owned here and published to the shared job
/// state after every change. Returns the plugin's handoff unless the stage
/// failed before or during `start`.
pub(super) async fn run_stage(
    ctx: &ExecutionContext,
    job: &ReplayJob,
    stage: Stage,
    shared: &SharedJobState,
    stop: &CancellationToken,
    handoff: Option<&Handoff>,
) -> Option<Handoff> {
    let step = shared.read().stage(stage).clone();
    let mut run = StageRun {
        ctx,
        job,
        stage,
        shared,
        stop,
        step,
    };
    run.execute(handoff).await
}

struct StageRun<'a> {
    ctx: &'a ExecutionContext,
    job: &'a ReplayJob,
    stage: Stage,
    shared: &'a SharedJobState,
    stop: &'a CancellationToken,
    step: StepState,
}

impl StageRun<'_> {
    async fn execute(&mut self, handoff: Option<&Handoff>) -> Option<Handoff> {
        info!(stage = %self.stage, "Performing {}", self.stage);

        let timeout = match self.job.stage_timeout(self.stage) {
            Ok(timeout) => timeout,
            Err(e) => {
                self.classify(e);
                self.publish();
                return None;
            }
        };

        let is_replay = self.stage == Stage::Replay;
        if is_replay {
            self.ctx.diagram.reset();
        }

        let context = PluginContext {
            job_name: self.job.job_name.clone(),
            stage: self.stage,
            diagram: is_replay.then(|| self.ctx.diagram.clone()),
            plugin_path: None,
        };
        let mut plugin = match self.ctx.plugins.load(self.job.plugin_ref(self.stage), context) {
            Ok(plugin) => plugin,
            Err(e) => {
                self.classify(e.into());
                self.publish();
                return None;
            }
        };

        let result = AssertUnwindSafe(self.drive(plugin.as_mut(), timeout, handoff))
            .catch_unwind()
            .await;
        let output = match result {
            Ok(Ok(output)) => Some(output),
            Ok(Err(e)) => {
                self.classify(e);
                None
            }
            Err(payload) => {
                let message = panic_message(payload);
                error!(stage = %self.stage, panic = %message, "Plugin panicked during {}", self.stage);
                self.step.fail(format!("Plugin panicked: {message}"));
                None
            }
        };

        let final_state = self.step.state;
        match AssertUnwindSafe(plugin.cleanup(final_state)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(stage = %self.stage, error = %e, "Plugin cleanup failed"),
            Err(payload) => {
                warn!(stage = %self.stage, panic = %panic_message(payload), "Plugin cleanup panicked")
            }
        }
        if is_replay {
            self.ctx.diagram.reset();
        }

        self.publish();
        info!(
            stage = %self.stage,
            state = %self.step.state,
            elapsed = self.step.elapsed_time,
            "{} finished with state {}",
            self.stage,
            self.step.state
        );
        output
    }

    async fn drive(
        &mut self,
        plugin: &mut dyn StagePlugin,
        timeout: Option<Duration>,
        handoff: Option<&Handoff>,
    ) -> Result<Handoff> {
        let trigger = if self.stage == Stage::Replay {
            match plugin.log_callback() {
                Some(callback) => self.ctx.diagram.set_log_callback(Some(callback)),
                None => debug!("Replay plugin has no log callback"),
            }
            self.ctx
                .diagram
                .load_diagram(Path::new(&self.job.diagram_reference))?;
            debug!("Diagram loaded");

            if self.job.autostart() {
                None
            } else {
                Some(StartFlag::create(&self.ctx.shm_dir, &self.job.job_name)?)
            }
        } else {
            None
        };

        let output = plugin
            .start(&StageInput {
                job: self.job,
                stage: self.stage,
                handoff,
            })
            .await?;

        self.step.state = RunState::Running;
        self.publish();

        if let Some(flag) = &trigger
            && !self.wait_for_trigger(flag).await
        {
            return Ok(output);
        }

        let started = Instant::now();
        while self.step.state == RunState::Running {
            tokio::time::sleep(self.ctx.poll_interval).await;

            plugin
                .get_progress(&mut StepProgress::new(&mut self.step))
                .await?;
            self.step.elapsed_time = started.elapsed().as_secs_f64();

            if self.step.state != RunState::Running {
                // The plugin ended the stage itself.
            } else if let Some(limit) = timeout
                && started.elapsed() > limit
            {
                warn!(stage = %self.stage, timeout = ?limit, "Stage timed out");
                self.step.state = RunState::Timeout;
            } else if self.stop.is_cancelled() {
                info!(stage = %self.stage, "Stage aborted");
                self.step.state = RunState::Aborted;
            }
            self.publish();
        }

        Ok(output)
    }

    /// Wait until the start flag is set. Returns `false` if the job was
    /// stopped first, leaving the stage `ABORTED`.
    async fn wait_for_trigger(&mut self, flag: &StartFlag) -> bool {
        info!(segment = %flag.name(), "Waiting for start trigger");
        self.step.message = WAITING_FOR_TRIGGER.to_string();
        self.publish();

        loop {
            tokio::time::sleep(self.ctx.poll_interval).await;
            if flag.is_set() {
                info!(segment = %flag.name(), "Start trigger received");
                self.step.message.clear();
                self.publish();
                return true;
            }
            if self.stop.is_cancelled() {
                info!("Stopped while waiting for start trigger");
                self.step.state = RunState::Aborted;
                self.publish();
                return false;
            }
        }
    }

    /// Record a failure in the step state.
    ///
    /// An explicit stage state from the plugin is applied verbatim; anything
    /// else only overwrites a still open state.
    fn classify(&mut self, err: Error) {
        match err {
            Error::Plugin(PluginError::Step { state, message }) => {
                error!(stage = %self.stage, state = %state, "{} ended with error {}: {}", self.stage, state, message);
                self.step.state = state;
                self.step.message = message;
            }
            other => {
                error!(stage = %self.stage, error = ?other, "Exception occurred during {}", self.stage);
                self.step.fail(other.to_string());
            }
        }
    }

    fn publish(&self) {
        *self.shared.write().stage_mut(self.stage) = self.step.clone();
    }
}
