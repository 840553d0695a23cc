//! Shared concurrency gates bounding each stage.

use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::config::{GateWidths, SchedulerConfig};

/// Gates shared by every executor, sized once at startup.
///
/// `overall` bounds how many executions are past admission, `download` and
/// `upload` bound their stages, and `replay` admits one job at a time.
#[derive(Debug)]
pub struct StageGates {
    widths: GateWidths,
    overall: Semaphore,
    download: Semaphore,
    replay: Mutex<()>,
    upload: Semaphore,
}

impl StageGates {
    pub fn new(config: &SchedulerConfig) -> Self {
        let widths = config.gate_widths();
        Self {
            widths,
            overall: Semaphore::new(widths.overall),
            download: Semaphore::new(widths.download),
            replay: Mutex::new(()),
            upload: Semaphore::new(widths.upload),
        }
    }

    pub fn widths(&self) -> GateWidths {
        self.widths
    }

    /// Wait for an admission slot; `None` if stopped while waiting.
    pub async fn overall(&self, stop: &CancellationToken) -> Option<SemaphorePermit<'_>> {
        acquire(&self.overall, stop).await
    }

    pub async fn download(&self, stop: &CancellationToken) -> Option<SemaphorePermit<'_>> {
        acquire(&self.download, stop).await
    }

    pub async fn upload(&self, stop: &CancellationToken) -> Option<SemaphorePermit<'_>> {
        acquire(&self.upload, stop).await
    }

    /// Wait for exclusive use of the replay rig; `None` if stopped while waiting.
    pub async fn replay(&self, stop: &CancellationToken) -> Option<MutexGuard<'_, ()>> {
        tokio::select! {
            guard = self.replay.lock() => Some(guard),
            _ = stop.cancelled() => None,
        }
    }
}

async fn acquire<'a>(
    semaphore: &'a Semaphore,
    stop: &CancellationToken,
) -> Option<SemaphorePermit<'a>> {
    tokio::select! {
        permit = semaphore.acquire() => permit.ok(),
        _ = stop.cancelled() => None,
    }
}
