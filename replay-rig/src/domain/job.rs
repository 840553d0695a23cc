//! Replay job definition as supplied by callers.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::Stage;
use crate::{Error, Result};

/// `replay_data` key holding the download stage timeout in seconds.
pub const DOWNLOAD_TIMEOUT_KEY: &str = "download_timeout";
/// `replay_data` key holding the upload stage timeout in seconds.
pub const UPLOAD_TIMEOUT_KEY: &str = "upload_timeout";
/// `replay_data` key controlling whether replay starts without a trigger.
pub const AUTOSTART_KEY: &str = "autostart";

/// Immutable description of one replay job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayJob {
    /// Human identifier. Not unique.
    pub job_name: String,
    /// Path of the real-time diagram asset.
    pub diagram_reference: String,
    #[serde(default)]
    pub execute_download: bool,
    #[serde(default)]
    pub execute_upload: bool,
    #[serde(default)]
    pub download_plugin_ref: String,
    /// Empty selects the default replay plugin.
    #[serde(default)]
    pub replay_plugin_ref: String,
    #[serde(default)]
    pub upload_plugin_ref: String,
    /// Replay stage timeout in seconds; `<= 0` is unbounded.
    #[serde(default)]
    pub timeout: i64,
    /// Per-stage timeouts and free-form plugin configuration.
    #[serde(default)]
    pub replay_data: BTreeMap<String, String>,
    /// Log file locations handed to the replay and upload plugins.
    #[serde(default)]
    pub log_files: BTreeMap<String, String>,
}

impl ReplayJob {
    pub fn new(job_name: impl Into<String>, diagram_reference: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            diagram_reference: diagram_reference.into(),
            ..Default::default()
        }
    }

    pub fn with_download(mut self, plugin: impl Into<String>) -> Self {
        self.execute_download = true;
        self.download_plugin_ref = plugin.into();
        self
    }

    pub fn with_replay_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.replay_plugin_ref = plugin.into();
        self
    }

    pub fn with_upload(mut self, plugin: impl Into<String>) -> Self {
        self.execute_upload = true;
        self.upload_plugin_ref = plugin.into();
        self
    }

    pub fn with_timeout(mut self, secs: i64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn with_replay_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.replay_data.insert(key.into(), value.into());
        self
    }

    pub fn with_log_file(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.log_files.insert(key.into(), value.into());
        self
    }

    /// Plugin reference configured for a stage.
    pub fn plugin_ref(&self, stage: Stage) -> &str {
        match stage {
            Stage::Download => &self.download_plugin_ref,
            Stage::Replay => &self.replay_plugin_ref,
            Stage::Upload => &self.upload_plugin_ref,
        }
    }

    /// Whether a stage is configured to run at all.
    pub fn executes(&self, stage: Stage) -> bool {
        match stage {
            Stage::Download => self.execute_download,
            Stage::Replay => true,
            Stage::Upload => self.execute_upload,
        }
    }

    /// Time budget of a stage, `None` when unbounded.
    ///
    /// Download and upload budgets come from `replay_data`; a missing key is
    /// unbounded, a value that is not an integer is an error.
    pub fn stage_timeout(&self, stage: Stage) -> Result<Option<Duration>> {
        let secs = match stage {
            Stage::Replay => self.timeout,
            Stage::Download => self.parse_timeout(DOWNLOAD_TIMEOUT_KEY)?,
            Stage::Upload => self.parse_timeout(UPLOAD_TIMEOUT_KEY)?,
        };
        Ok((secs > 0).then(|| Duration::from_secs(secs as u64)))
    }

    fn parse_timeout(&self, key: &str) -> Result<i64> {
        match self.replay_data.get(key) {
            None => Ok(0),
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                Error::validation(format!(
                    "job '{}': {} must be an integer number of seconds, got '{}'",
                    self.job_name, key, raw
                ))
            }),
        }
    }

    /// Whether replay starts right after configuration or waits for a trigger.
    pub fn autostart(&self) -> bool {
        self.replay_data
            .get(AUTOSTART_KEY)
            .is_none_or(|v| !v.trim().eq_ignore_ascii_case("false"))
    }

    /// Admission-time checks.
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(Error::validation("job_name must not be empty"));
        }
        if self.diagram_reference.trim().is_empty() {
            return Err(Error::validation(format!(
                "job '{}': diagram_reference must not be empty",
                self.job_name
            )));
        }
        for stage in [Stage::Download, Stage::Upload] {
            if self.executes(stage) && self.plugin_ref(stage).trim().is_empty() {
                return Err(Error::validation(format!(
                    "job '{}': {} is enabled but no plugin is configured",
                    self.job_name, stage
                )));
            }
        }
        for stage in Stage::ALL {
            self.stage_timeout(stage)?;
        }
        Ok(())
    }
}
