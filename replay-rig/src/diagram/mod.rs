//! Process-wide real-time diagram engine.
//!
//! The engine cannot be instantiated twice, so `main` owns exactly one
//! instance and hands it to every executor as an `Arc<dyn DiagramEngine>`.
//! Replay plugins drive the loaded diagram; the scheduler only resets it,
//! loads the job's diagram and routes engine reports to `tracing` and to the
//! plugin's log callback.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

/// Log target of engine reports; its level is configured separately.
pub const DIAGRAM_LOG_TARGET: &str = "replay_rig::diagram";

/// Callback invoked for every engine report with `(level, message)`.
pub type LogCallback = Arc<dyn Fn(u8, &str) -> std::result::Result<(), String> + Send + Sync>;

/// Severity of an engine report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReportLevel {
    Info,
    Warning,
    Error,
    Debug,
}

impl ReportLevel {
    /// Map a raw engine level. Unknown levels are treated as debug output.
    pub fn from_raw(level: u8) -> Self {
        match level {
            0 => Self::Info,
            1 => Self::Warning,
            2 => Self::Error,
            _ => Self::Debug,
        }
    }
}

/// Capability interface of the real-time diagram engine.
pub trait DiagramEngine: Send + Sync {
    /// Shut the current diagram down and forget recorded errors and the
    /// installed callback.
    fn reset(&self);

    /// Load a diagram file.
    fn load_diagram(&self, path: &Path) -> Result<()>;

    /// Install (or clear) the callback receiving engine reports.
    fn set_log_callback(&self, callback: Option<LogCallback>);

    /// Deliver one engine report.
    fn report(&self, level: u8, message: &str);

    /// Whether an error was reported since the last reset.
    fn has_error(&self) -> bool;

    /// Error reports recorded since the last reset.
    fn error_messages(&self) -> Vec<String>;
}

#[derive(Default)]
struct EngineState {
    diagram: Option<PathBuf>,
    callback: Option<LogCallback>,
    errors: Vec<String>,
}

/// In-process diagram engine forwarding reports to `tracing`.
#[derive(Default)]
pub struct LocalDiagramEngine {
    state: Mutex<EngineState>,
}

impl LocalDiagramEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently loaded diagram, if any.
    pub fn loaded_diagram(&self) -> Option<PathBuf> {
        self.state.lock().diagram.clone()
    }
}

impl DiagramEngine for LocalDiagramEngine {
    fn reset(&self) {
        let mut state = self.state.lock();
        if let Some(diagram) = state.diagram.take() {
            debug!(target: DIAGRAM_LOG_TARGET, diagram = %diagram.display(), "Diagram shut down");
        }
        state.callback = None;
        state.errors.clear();
    }

    fn load_diagram(&self, path: &Path) -> Result<()> {
        let metadata =
            std::fs::metadata(path).map_err(|e| Error::io_path("loading diagram", path, e))?;
        if !metadata.is_file() {
            return Err(Error::validation(format!(
                "Diagram {} is not a file",
                path.display()
            )));
        }

        self.state.lock().diagram = Some(path.to_path_buf());
        info!(target: DIAGRAM_LOG_TARGET, diagram = %path.display(), "Diagram loaded");
        Ok(())
    }

    fn set_log_callback(&self, callback: Option<LogCallback>) {
        self.state.lock().callback = callback;
    }

    fn report(&self, level: u8, message: &str) {
        let level = ReportLevel::from_raw(level);
        match level {
            ReportLevel::Info => info!(target: DIAGRAM_LOG_TARGET, "{}", message),
            ReportLevel::Warning => warn!(target: DIAGRAM_LOG_TARGET, "{}", message),
            ReportLevel::Error => error!(target: DIAGRAM_LOG_TARGET, "{}", message),
            ReportLevel::Debug => debug!(target: DIAGRAM_LOG_TARGET, "{}", message),
        }

        // The callback runs outside the lock so it may call back into the engine.
        let callback = {
            let mut state = self.state.lock();
            if level == ReportLevel::Error {
                state.errors.push(message.to_string());
            }
            state.callback.clone()
        };

        let Some(callback) = callback else {
            return;
        };

        let failure = match catch_unwind(AssertUnwindSafe(|| callback(level_raw(level), message))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some("log callback panicked".to_string()),
        };

        if let Some(failure) = failure {
            warn!(target: DIAGRAM_LOG_TARGET, error = %failure, "Log callback failed");
            self.state.lock().errors.push(failure);
        }
    }

    fn has_error(&self) -> bool {
        !self.state.lock().errors.is_empty()
    }

    fn error_messages(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }
}

fn level_raw(level: ReportLevel) -> u8 {
    match level {
        ReportLevel::Info => 0,
        ReportLevel::Warning => 1,
        ReportLevel::Error => 2,
        ReportLevel::Debug => 3,
    }
}
