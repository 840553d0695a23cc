//! Per-job state machine driving download, replay and upload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::gates::StageGates;
use super::stage::run_stage;
use crate::config::SchedulerConfig;
use crate::diagram::DiagramEngine;
use crate::domain::{JobState, ReplayJob, RunState, Stage, StepState};
use crate::plugin::PluginRegistry;

/// Job state shared between its executor (the only writer) and readers.
pub type SharedJobState = Arc<RwLock<JobState>>;

/// Whether an executor actually ran its job.
///
/// Only executed jobs changed state that needs persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ExecutionOutcome {
    Executed,
    NotExecuted,
}

/// Process-wide resources every executor runs against.
pub struct ExecutionContext {
    pub gates: StageGates,
    pub plugins: PluginRegistry,
    pub diagram: Arc<dyn DiagramEngine>,
    pub poll_interval: Duration,
    /// Directory backing start trigger segments.
    pub shm_dir: PathBuf,
}

impl ExecutionContext {
    pub fn new(
        config: &SchedulerConfig,
        plugins: PluginRegistry,
        diagram: Arc<dyn DiagramEngine>,
        shm_dir: PathBuf,
    ) -> Self {
        Self {
            gates: StageGates::new(config),
            plugins,
            diagram,
            poll_interval: config.poll_interval,
            shm_dir,
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("gates", &self.gates)
            .field("plugins", &self.plugins)
            .field("poll_interval", &self.poll_interval)
            .field("shm_dir", &self.shm_dir)
            .finish_non_exhaustive()
    }
}

/// Runs one job through its stages.
pub struct JobExecutor {
    id: Uuid,
    job: ReplayJob,
    state: SharedJobState,
    stop: CancellationToken,
    context: Arc<ExecutionContext>,
}

impl JobExecutor {
    /// Create an executor for `state`, whose embedded job is the one run.
    pub fn new(state: JobState, context: Arc<ExecutionContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: state.current_job.clone(),
            state: Arc::new(RwLock::new(state)),
            stop: CancellationToken::new(),
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn job(&self) -> &ReplayJob {
        &self.job
    }

    pub fn shared_state(&self) -> SharedJobState {
        self.state.clone()
    }

    /// Consistent copy of the current state.
    pub fn snapshot(&self) -> JobState {
        self.state.read().clone()
    }

    /// Request a cooperative stop, honoured at the next check point.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Force the overall state to `ERROR` after the driver failed outright.
    pub fn force_error(&self, reason: &str) {
        let mut state = self.state.write();
        error!(job = %self.job.job_name, reason, "Forcing job into ERROR");
        state.overall_state = RunState::Error;
    }

    /// Run the job. Returns whether it was actually executed.
    pub async fn execute(&self) -> ExecutionOutcome {
        let span = info_span!("job", name = %self.job.job_name, id = %self.id);
        self.run().instrument(span).await
    }

    async fn run(&self) -> ExecutionOutcome {
        let initial = self.state.read().overall_state;
        if initial != RunState::Pending {
            debug!(state = %initial, "Job is not PENDING, skipping");
            return ExecutionOutcome::NotExecuted;
        }
        if self.is_stopped() {
            info!("Job stopped before start, skipping");
            return ExecutionOutcome::NotExecuted;
        }

        if !Path::new(&self.job.diagram_reference).exists() {
            error!(diagram = %self.job.diagram_reference, "Diagram not found");
            let mut state = self.state.write();
            state.replay_state.state = RunState::Error;
            state.replay_state.message = "Diagram not found".to_string();
            state.overall_state = RunState::Error;
            return ExecutionOutcome::Executed;
        }

        let gates = &self.context.gates;

        let Some(_admission) = gates.overall(&self.stop).await else {
            info!("Stopped while waiting for admission, skipping");
            return ExecutionOutcome::NotExecuted;
        };

        // Download
        let Some(download_permit) = gates.download(&self.stop).await else {
            info!("Stopped while waiting for download slot, skipping");
            return ExecutionOutcome::NotExecuted;
        };
        if self.is_stopped() {
            // Nothing ran yet, so the job stays PENDING.
            info!("Skipping complete job");
            return ExecutionOutcome::NotExecuted;
        }

        self.advance(RunState::Running);
        info!("Executing job");

        let handoff = if self.job.execute_download {
            self.run_stage(Stage::Download, None).await
        } else {
            info!("Skipping download");
            self.skip(Stage::Download);
            None
        };
        drop(download_permit);
        if self.stage_state(Stage::Download) == RunState::Error {
            return self.fail_at(Stage::Download);
        }

        // Replay
        let Some(replay_guard) = gates.replay(&self.stop).await else {
            return self.abort_before(Stage::Replay);
        };
        if self.is_stopped() {
            return self.abort_before(Stage::Replay);
        }
        self.run_stage(Stage::Replay, handoff.as_ref()).await;
        drop(replay_guard);
        if self.stage_state(Stage::Replay) == RunState::Error {
            return self.fail_at(Stage::Replay);
        }

        // Upload
        let Some(upload_permit) = gates.upload(&self.stop).await else {
            return self.abort_before(Stage::Upload);
        };
        if self.is_stopped() {
            return self.abort_before(Stage::Upload);
        }
        if self.job.execute_upload {
            self.run_stage(Stage::Upload, None).await;
        } else {
            info!("Skipping upload");
            self.skip(Stage::Upload);
        }
        drop(upload_permit);
        if self.stage_state(Stage::Upload) == RunState::Error {
            return self.fail_at(Stage::Upload);
        }

        let settled = self.state.read().settled_state();
        self.advance(settled);
        info!(state = %settled, "Job finished with state {}", settled);
        ExecutionOutcome::Executed
    }

    async fn run_stage(
        &self,
        stage: Stage,
        handoff: Option<&serde_json::Value>,
    ) -> Option<serde_json::Value> {
        run_stage(
            &self.context,
            &self.job,
            stage,
            &self.state,
            &self.stop,
            handoff,
        )
        .await
    }

    fn stage_state(&self, stage: Stage) -> RunState {
        self.state.read().stage(stage).state
    }

    fn skip(&self, stage: Stage) {
        *self.state.write().stage_mut(stage) = StepState::with_state(RunState::NotExecuted);
    }

    fn advance(&self, target: RunState) {
        if let Err(e) = self.state.write().advance(target) {
            warn!(error = %e, "Ignoring overall state change");
        }
    }

    fn fail_at(&self, stage: Stage) -> ExecutionOutcome {
        error!(stage = %stage, "Error occurred in {}", stage);
        self.advance(RunState::Error);
        ExecutionOutcome::Executed
    }

    fn abort_before(&self, stage: Stage) -> ExecutionOutcome {
        info!(stage = %stage, "Job stopped, skipping {} and later stages", stage);
        self.advance(RunState::Aborted);
        ExecutionOutcome::Executed
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("id", &self.id)
            .field("job", &self.job.job_name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use start_flag::StartFlag;

    use crate::diagram::LocalDiagramEngine;
    use crate::domain::job::{AUTOSTART_KEY, DOWNLOAD_TIMEOUT_KEY, UPLOAD_TIMEOUT_KEY};
    use crate::pipeline::WAITING_FOR_TRIGGER;
    use crate::plugin::{
        Handoff, PluginDescriptor, PluginError, StageInput, StagePlugin, StepProgress,
    };

    #[derive(Clone, Copy)]
    enum Behaviour {
        Finish,
        RunForever,
        FailStart,
        EndWith(RunState),
        PanicOnStart,
        PanicOnPoll,
    }

    type Seen = Arc<parking_lot::Mutex<Vec<(Stage, Option<Handoff>)>>>;
    type Cleanups = Arc<parking_lot::Mutex<Vec<RunState>>>;

    struct Scripted {
        behaviour: Behaviour,
        seen: Seen,
        cleanups: Cleanups,
    }

    #[async_trait]
    impl StagePlugin for Scripted {
        async fn start(&mut self, input: &StageInput<'_>) -> Result<Handoff, PluginError> {
            self.seen
                .lock()
                .push((input.stage, input.handoff.cloned()));
            match self.behaviour {
                Behaviour::FailStart => Err(PluginError::failed("start exploded")),
                Behaviour::PanicOnStart => panic!("plugin blew up in start"),
                _ => Ok(serde_json::json!({ "from": input.stage.to_string() })),
            }
        }

        async fn get_progress(&mut self, progress: &mut StepProgress<'_>) -> Result<(), PluginError> {
            match self.behaviour {
                Behaviour::Finish => progress.finish(),
                Behaviour::RunForever | Behaviour::FailStart | Behaviour::PanicOnStart => {
                    progress.set_progress(50.0)
                }
                Behaviour::PanicOnPoll => panic!("plugin blew up in get_progress"),
                Behaviour::EndWith(state) => {
                    return Err(PluginError::step(state, "operator abort"));
                }
            }
            Ok(())
        }

        async fn cleanup(&mut self, final_state: RunState) -> Result<(), PluginError> {
            self.cleanups.lock().push(final_state);
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        diagram: String,
        engine: Arc<LocalDiagramEngine>,
        context: Arc<ExecutionContext>,
        seen: Seen,
        cleanups: Cleanups,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let diagram = dir.path().join("replay.rtd");
        std::fs::write(&diagram, b"diagram").unwrap();

        let seen: Seen = Arc::default();
        let cleanups: Cleanups = Arc::default();
        let mut plugins = PluginRegistry::new();
        for (name, behaviour) in [
            ("finish", Behaviour::Finish),
            ("forever", Behaviour::RunForever),
            ("boom", Behaviour::FailStart),
            ("aborting", Behaviour::EndWith(RunState::Aborted)),
            ("panic_start", Behaviour::PanicOnStart),
            ("panic_poll", Behaviour::PanicOnPoll),
        ] {
            let seen = seen.clone();
            let cleanups = cleanups.clone();
            plugins.register(PluginDescriptor::new(name).with_all_roles(move |_ctx| {
                Ok(Box::new(Scripted {
                    behaviour,
                    seen: seen.clone(),
                    cleanups: cleanups.clone(),
                }) as Box<dyn StagePlugin>)
            }));
        }

        let config = SchedulerConfig::default().with_poll_interval(Duration::from_millis(100));
        let engine = Arc::new(LocalDiagramEngine::new());
        let context = Arc::new(ExecutionContext::new(
            &config,
            plugins,
            engine.clone(),
            dir.path().join("shm"),
        ));

        Harness {
            diagram: diagram.to_string_lossy().into_owned(),
            _dir: dir,
            engine,
            context,
            seen,
            cleanups,
        }
    }

    impl Harness {
        fn job(&self, name: &str) -> ReplayJob {
            ReplayJob::new(name, self.diagram.clone()).with_replay_plugin("finish")
        }

        fn executor(&self, job: ReplayJob) -> Arc<JobExecutor> {
            Arc::new(JobExecutor::new(JobState::new(job), self.context.clone()))
        }

        fn shm_dir(&self) -> &Path {
            &self.context.shm_dir
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_download_still_replays() {
        let h = harness();
        let executor = h.executor(h.job("job"));

        assert_eq!(executor.execute().await, ExecutionOutcome::Executed);

        let state = executor.snapshot();
        assert_eq!(state.download_state.state, RunState::NotExecuted);
        assert_eq!(state.replay_state.state, RunState::Finished);
        assert_eq!(state.upload_state.state, RunState::NotExecuted);
        assert_eq!(state.overall_state, RunState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_handoff_reaches_replay() {
        let h = harness();
        let executor = h.executor(h.job("job").with_download("finish").with_upload("finish"));

        executor.execute().await;

        let seen = h.seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (Stage::Download, None));
        assert_eq!(
            seen[1],
            (Stage::Replay, Some(serde_json::json!({ "from": "download" })))
        );
        assert_eq!(seen[2], (Stage::Upload, None));
        assert_eq!(executor.snapshot().overall_state, RunState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_error_short_circuits() {
        let h = harness();
        let executor = h.executor(h.job("job").with_download("boom").with_upload("finish"));

        assert_eq!(executor.execute().await, ExecutionOutcome::Executed);

        let state = executor.snapshot();
        assert_eq!(state.download_state.state, RunState::Error);
        assert!(state.download_state.message.contains("start exploded"));
        assert_eq!(state.replay_state.state, RunState::Pending);
        assert_eq!(state.upload_state.state, RunState::Pending);
        assert_eq!(state.overall_state, RunState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_replay_plugin_fails_stage() {
        let h = harness();
        let executor = h.executor(h.job("job").with_replay_plugin("missing"));

        executor.execute().await;

        let state = executor.snapshot();
        assert_eq!(state.replay_state.state, RunState::Error);
        assert!(state.replay_state.message.contains("not found"));
        assert_eq!(state.overall_state, RunState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_times_out() {
        let h = harness();
        let executor = h.executor(h.job("job").with_replay_plugin("forever").with_timeout(5));

        assert_eq!(executor.execute().await, ExecutionOutcome::Executed);

        let state = executor.snapshot();
        assert_eq!(state.replay_state.state, RunState::Timeout);
        assert!(state.replay_state.elapsed_time >= 5.0);
        assert_eq!(state.overall_state, RunState::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_timeout_lets_later_stages_run() {
        let h = harness();
        let executor = h.executor(
            h.job("job")
                .with_download("forever")
                .with_replay_data(DOWNLOAD_TIMEOUT_KEY, "3")
                .with_upload("finish"),
        );

        assert_eq!(executor.execute().await, ExecutionOutcome::Executed);

        let state = executor.snapshot();
        assert_eq!(state.download_state.state, RunState::Timeout);
        assert!(state.download_state.elapsed_time >= 3.0);
        assert_eq!(state.replay_state.state, RunState::Finished);
        assert_eq!(state.upload_state.state, RunState::Finished);
        assert_eq!(state.overall_state, RunState::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_times_out() {
        let h = harness();
        let executor = h.executor(
            h.job("job")
                .with_upload("forever")
                .with_replay_data(UPLOAD_TIMEOUT_KEY, "2"),
        );

        assert_eq!(executor.execute().await, ExecutionOutcome::Executed);

        let state = executor.snapshot();
        assert_eq!(state.replay_state.state, RunState::Finished);
        assert_eq!(state.upload_state.state, RunState::Timeout);
        assert!(state.upload_state.elapsed_time >= 2.0);
        assert_eq!(state.overall_state, RunState::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_get_progress_fails_stage_and_cleans_up() {
        let h = harness();
        let executor = h.executor(h.job("job").with_replay_plugin("panic_poll").with_upload("finish"));

        assert_eq!(executor.execute().await, ExecutionOutcome::Executed);

        let state = executor.snapshot();
        assert_eq!(state.replay_state.state, RunState::Error);
        assert!(state.replay_state.message.contains("plugin blew up in get_progress"));
        assert_eq!(state.upload_state.state, RunState::Pending);
        assert_eq!(state.overall_state, RunState::Error);
        assert_eq!(*h.cleanups.lock(), vec![RunState::Error]);
        assert!(h.engine.loaded_diagram().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_start_fails_stage_and_cleans_up() {
        let h = harness();
        let executor = h.executor(h.job("job").with_download("panic_start"));

        assert_eq!(executor.execute().await, ExecutionOutcome::Executed);

        let state = executor.snapshot();
        assert_eq!(state.download_state.state, RunState::Error);
        assert!(state.download_state.message.contains("plugin blew up in start"));
        assert_eq!(state.replay_state.state, RunState::Pending);
        assert_eq!(state.overall_state, RunState::Error);
        assert_eq!(*h.cleanups.lock(), vec![RunState::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_plugin_state_is_kept() {
        let h = harness();
        let executor = h.executor(h.job("job").with_replay_plugin("aborting"));

        executor.execute().await;

        let state = executor.snapshot();
        assert_eq!(state.replay_state.state, RunState::Aborted);
        assert_eq!(state.replay_state.message, "operator abort");
        assert_eq!(state.overall_state, RunState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_is_not_executed() {
        let h = harness();
        let executor = h.executor(h.job("job"));

        executor.stop();
        assert_eq!(executor.execute().await, ExecutionOutcome::NotExecuted);
        assert_eq!(executor.snapshot().overall_state, RunState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_replay_aborts() {
        let h = harness();
        let executor = h.executor(h.job("job").with_replay_plugin("forever").with_upload("finish"));

        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });
        while executor.snapshot().replay_state.state != RunState::Running {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        executor.stop();

        assert_eq!(task.await.unwrap(), ExecutionOutcome::Executed);
        let state = executor.snapshot();
        assert_eq!(state.replay_state.state, RunState::Aborted);
        assert_eq!(state.upload_state.state, RunState::Pending);
        assert_eq!(state.overall_state, RunState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_download_aborts() {
        let h = harness();
        let executor = h.executor(h.job("job").with_download("forever").with_upload("finish"));

        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });
        while executor.snapshot().download_state.state != RunState::Running {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        executor.stop();

        assert_eq!(task.await.unwrap(), ExecutionOutcome::Executed);
        let state = executor.snapshot();
        assert_eq!(state.download_state.state, RunState::Aborted);
        assert_eq!(state.replay_state.state, RunState::Pending);
        assert_eq!(state.upload_state.state, RunState::Pending);
        assert_eq!(state.overall_state, RunState::Aborted);
        assert_eq!(h.seen.lock().len(), 1);
        assert_eq!(*h.cleanups.lock(), vec![RunState::Aborted]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_pending_job_is_skipped() {
        let h = harness();
        let mut state = JobState::new(h.job("job"));
        state.overall_state = RunState::Error;
        let executor = JobExecutor::new(state, h.context.clone());

        assert_eq!(executor.execute().await, ExecutionOutcome::NotExecuted);
        assert!(h.seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_waits_for_start_trigger() {
        let h = harness();
        let executor = h.executor(h.job("deferred").with_replay_data(AUTOSTART_KEY, "False"));

        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });
        while executor.snapshot().replay_state.message != WAITING_FOR_TRIGGER {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(executor.snapshot().replay_state.state, RunState::Running);

        StartFlag::open(h.shm_dir(), "deferred")
            .unwrap()
            .trigger()
            .unwrap();

        assert_eq!(task.await.unwrap(), ExecutionOutcome::Executed);
        assert_eq!(executor.snapshot().overall_state, RunState::Finished);
        // The segment is removed once the stage ends.
        assert!(StartFlag::open(h.shm_dir(), "deferred").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_for_trigger_aborts() {
        let h = harness();
        let executor = h.executor(h.job("deferred").with_replay_data(AUTOSTART_KEY, "false"));

        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });
        while executor.snapshot().replay_state.message != WAITING_FOR_TRIGGER {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        executor.stop();

        task.await.unwrap();
        let state = executor.snapshot();
        assert_eq!(state.replay_state.state, RunState::Aborted);
        assert_eq!(state.overall_state, RunState::Aborted);
    }
}
