//! Durable storage of the job queue.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{JobState, ReplayJob};
use crate::utils::fs::{io_error, write_atomic};
use crate::{Error, Result};

/// Version of the persisted document layout.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// One queued job as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub job: ReplayJob,
    pub state: JobState,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    jobs: Vec<PersistedJob>,
}

/// Storage backend of the job queue.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Replace the stored queue.
    async fn save(&self, jobs: &[PersistedJob]) -> Result<()>;

    /// Load the stored queue; `None` when nothing was stored yet.
    async fn load(&self) -> Result<Option<Vec<PersistedJob>>>;

    /// Human readable location, for logs.
    fn location(&self) -> String;
}

/// JSON file written atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueueRepository for JsonFileRepository {
    async fn save(&self, jobs: &[PersistedJob]) -> Result<()> {
        let mut jobs = jobs.to_vec();
        for job in &mut jobs {
            job.state.normalize();
        }
        let document = PersistedQueue {
            version: QUEUE_FORMAT_VERSION,
            jobs,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), jobs = document.jobs.len(), "Stored jobs");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<PersistedJob>>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("reading", &self.path, e)),
        };

        let document: PersistedQueue = serde_json::from_slice(&bytes)?;
        if document.version != QUEUE_FORMAT_VERSION {
            return Err(Error::config(format!(
                "unsupported queue format version {} in {}",
                document.version,
                self.path.display()
            )));
        }
        Ok(Some(document.jobs))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
