//! Plugin running an external command for the download or upload stage.
//!
//! The command line is read from `replay_data` (`download_command` or
//! `upload_command`) and executed through the platform shell. Exit code 0
//! finishes the stage; anything else fails it with the tail of stderr.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::{RunState, Stage};
use crate::plugin::{Handoff, PluginError, StageInput, StagePlugin, StepProgress};

pub const NAME: &str = "command";

const STDERR_TAIL_LINES: usize = 20;

/// `replay_data` key holding the command line for a stage.
pub fn command_key(stage: Stage) -> String {
    format!("{stage}_command")
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Runs one shell command and reports its outcome.
pub struct CommandPlugin {
    stage: Stage,
    exit: Option<oneshot::Receiver<Option<i32>>>,
    cancel: CancellationToken,
    stderr_tail: StderrTail,
    pid: Option<u32>,
}

impl CommandPlugin {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            exit: None,
            cancel: CancellationToken::new(),
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            pid: None,
        }
    }

    fn tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn shell_command(command_line: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
}

/// Wait for the process to exit and send its exit code.
///
/// If the token is cancelled first, the process is killed and `None` is sent.
/// The stderr reader is drained before the code is sent so the tail is
/// complete when the caller observes the exit.
fn spawn_process_waiter(
    mut child: Child,
    stderr_reader: Option<JoinHandle<()>>,
    cancellation_token: CancellationToken,
) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit_code = tokio::select! {
            _ = cancellation_token.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill process: {}", e);
                }
                None
            }
            status = child.wait() => {
                match status {
                    Ok(exit_status) => {
                        let code = exit_status.code();
                        if let Some(c) = code
                            && c != 0
                        {
                            warn!("Process exited with code: {}", c);
                        }
                        Some(code.unwrap_or(-1))
                    }
                    Err(e) => {
                        error!("Error waiting for process: {}", e);
                        Some(-1)
                    }
                }
            }
        };

        if let Some(reader) = stderr_reader {
            let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
        }
        let _ = tx.send(exit_code);
    });

    rx
}

fn spawn_stderr_reader(child: &mut Child, tail: StderrTail) -> Option<JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }))
}

#[async_trait]
impl StagePlugin for CommandPlugin {
    async fn start(&mut self, input: &StageInput<'_>) -> Result<Handoff, PluginError> {
        let key = command_key(self.stage);
        let command_line = input
            .replay_data()
            .get(&key)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PluginError::failed(format!("replay_data has no '{key}'")))?;

        let mut cmd = shell_command(command_line);
        cmd.env("REPLAY_JOB_NAME", &input.job.job_name)
            .env("REPLAY_STAGE", self.stage.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        self.pid = child.id();
        debug!(stage = %self.stage, pid = ?self.pid, command = %command_line, "Command started");

        let reader = spawn_stderr_reader(&mut child, self.stderr_tail.clone());
        self.exit = Some(spawn_process_waiter(child, reader, self.cancel.clone()));

        Ok(serde_json::json!({
            "command": command_line,
            "pid": self.pid,
        }))
    }

    async fn get_progress(&mut self, progress: &mut StepProgress<'_>) -> Result<(), PluginError> {
        let Some(exit) = self.exit.as_mut() else {
            return Err(PluginError::failed("command was not started"));
        };

        match exit.try_recv() {
            Err(oneshot::error::TryRecvError::Empty) => {
                if let Some(pid) = self.pid {
                    progress.set_user_data("pid", pid.to_string());
                }
                progress.set_message("command running");
            }
            Ok(Some(0)) => {
                self.exit = None;
                progress.set_message("command finished");
                progress.finish();
            }
            Ok(Some(code)) => {
                self.exit = None;
                let tail = self.tail();
                let message = if tail.is_empty() {
                    format!("command exited with code {code}")
                } else {
                    format!("command exited with code {code}: {tail}")
                };
                progress.fail(message);
            }
            Ok(None) => {
                self.exit = None;
                progress.set_state(RunState::Aborted);
                progress.set_message("command killed");
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                self.exit = None;
                return Err(PluginError::failed("command waiter vanished"));
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self, final_state: RunState) -> Result<(), PluginError> {
        if self.exit.is_some() {
            debug!(stage = %self.stage, state = %final_state, "Killing running command");
        }
        self.cancel.cancel();
        Ok(())
    }
}
