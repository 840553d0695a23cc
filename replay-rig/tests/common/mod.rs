//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use replay_rig::config::SchedulerConfig;
use replay_rig::control::ControlService;
use replay_rig::diagram::LocalDiagramEngine;
use replay_rig::domain::{JobState, ReplayJob, RunState, Stage};
use replay_rig::pipeline::{ExecutionContext, JobStore, JsonFileRepository, QueueRepository};
use replay_rig::plugin::{
    Handoff, PluginDescriptor, PluginError, PluginRegistry, StageInput, StagePlugin, StepProgress,
};
use tempfile::TempDir;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observes what the scripted plugins did.
#[derive(Default)]
pub struct Recorder {
    active_replays: AtomicUsize,
    max_active_replays: AtomicUsize,
    starts: Mutex<Vec<(String, Stage)>>,
    cleanups: Mutex<Vec<(String, Stage, RunState)>>,
}

impl Recorder {
    pub fn max_active_replays(&self) -> usize {
        self.max_active_replays.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<(String, Stage)> {
        self.starts.lock().clone()
    }

    pub fn cleanups(&self) -> Vec<(String, Stage, RunState)> {
        self.cleanups.lock().clone()
    }

    pub fn cleanup_of(&self, job_name: &str, stage: Stage) -> Option<RunState> {
        self.cleanups
            .lock()
            .iter()
            .find(|(name, s, _)| name == job_name && *s == stage)
            .map(|(_, _, state)| *state)
    }
}

/// Finishes after `polls` progress queries; `None` runs until stopped.
struct Scripted {
    job_name: String,
    stage: Stage,
    polls: Option<usize>,
    polled: usize,
    panics: bool,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl StagePlugin for Scripted {
    async fn start(&mut self, input: &StageInput<'_>) -> Result<Handoff, PluginError> {
        if self.stage == Stage::Replay {
            let active = self.recorder.active_replays.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder
                .max_active_replays
                .fetch_max(active, Ordering::SeqCst);
        }
        self.recorder
            .starts
            .lock()
            .push((input.job.job_name.clone(), self.stage));
        Ok(Handoff::Null)
    }

    async fn get_progress(&mut self, progress: &mut StepProgress<'_>) -> Result<(), PluginError> {
        self.polled += 1;
        if self.panics {
            panic!("division by zero in {} progress", self.stage);
        }
        match self.polls {
            Some(polls) if self.polled >= polls => progress.finish(),
            Some(polls) => progress.set_progress(100.0 * self.polled as f32 / polls as f32),
            None => progress.set_message("running"),
        }
        Ok(())
    }

    async fn cleanup(&mut self, final_state: RunState) -> Result<(), PluginError> {
        if self.stage == Stage::Replay {
            self.recorder.active_replays.fetch_sub(1, Ordering::SeqCst);
        }
        self.recorder
            .cleanups
            .lock()
            .push((self.job_name.clone(), self.stage, final_state));
        Ok(())
    }
}

/// Registry with `quick` (one poll), `slow` (three polls), `forever` and
/// `panicky`, which panics on its first poll.
pub fn scripted_registry(recorder: &Arc<Recorder>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    for (name, polls, panics) in [
        ("quick", Some(1), false),
        ("slow", Some(3), false),
        ("forever", None, false),
        ("panicky", None, true),
    ] {
        let recorder = recorder.clone();
        registry.register(PluginDescriptor::new(name).with_all_roles(move |ctx| {
            Ok(Box::new(Scripted {
                job_name: ctx.job_name.clone(),
                stage: ctx.stage,
                polls,
                polled: 0,
                panics,
                recorder: recorder.clone(),
            }) as Box<dyn StagePlugin>)
        }));
    }
    registry
}

/// A scheduler over a temporary directory.
pub struct Rig {
    pub dir: TempDir,
    pub diagram: String,
    pub recorder: Arc<Recorder>,
    pub store: Arc<JobStore>,
    pub service: ControlService,
}

impl Rig {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::build(config, false)
    }

    pub fn persistent(config: SchedulerConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: SchedulerConfig, persistent: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let diagram = dir.path().join("replay.rtd");
        std::fs::write(&diagram, b"diagram").unwrap();

        let recorder = Arc::new(Recorder::default());
        let store = new_store(
            &config,
            &recorder,
            dir.path().join("shm"),
            persistent.then(|| dir.path().join("queue.json")),
        );
        let service = ControlService::new(store.clone());

        Self {
            diagram: diagram.to_string_lossy().into_owned(),
            dir,
            recorder,
            store,
            service,
        }
    }

    pub fn database(&self) -> PathBuf {
        self.dir.path().join("queue.json")
    }

    /// A job whose every stage uses `plugin`.
    pub fn job(&self, name: &str, plugin: &str) -> ReplayJob {
        ReplayJob::new(name, self.diagram.clone())
            .with_download(plugin)
            .with_replay_plugin(plugin)
            .with_upload(plugin)
    }

    /// A job that only replays with `plugin`.
    pub fn replay_only(&self, name: &str, plugin: &str) -> ReplayJob {
        ReplayJob::new(name, self.diagram.clone()).with_replay_plugin(plugin)
    }

    pub async fn state_of(&self, name: &str) -> Option<JobState> {
        self.service
            .get_all_job_states()
            .await
            .into_iter()
            .find(|s| s.current_job.job_name == name)
    }

    /// Poll until `predicate` holds for the job states, or panic.
    pub async fn wait_until<F>(&self, what: &str, predicate: F)
    where
        F: Fn(&[JobState]) -> bool,
    {
        for _ in 0..500 {
            if predicate(&self.service.get_all_job_states().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    pub async fn wait_until_settled(&self) {
        self.wait_until("all jobs to settle", |states| {
            states.iter().all(|s| s.overall_state.is_terminal())
        })
        .await;
    }
}

pub fn new_store(
    config: &SchedulerConfig,
    recorder: &Arc<Recorder>,
    shm_dir: PathBuf,
    database: Option<PathBuf>,
) -> Arc<JobStore> {
    let config = config.clone().with_poll_interval(POLL_INTERVAL);
    let context = Arc::new(ExecutionContext::new(
        &config,
        scripted_registry(recorder),
        Arc::new(LocalDiagramEngine::new()),
        shm_dir,
    ));
    let repository =
        database.map(|path| Arc::new(JsonFileRepository::new(path)) as Arc<dyn QueueRepository>);
    JobStore::new(context, repository)
}
