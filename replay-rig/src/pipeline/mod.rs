//! Job scheduling pipeline.
//!
//! The pipeline is responsible for:
//! - Keeping the ordered, persisted job queue
//! - Running job executors on a bounded worker pool
//! - Gating the download, replay and upload stages

mod executor;
mod gates;
mod job_store;
mod persistence;
mod stage;
mod worker_pool;

pub use executor::{ExecutionContext, ExecutionOutcome, JobExecutor, SharedJobState};
pub use gates::StageGates;
pub use job_store::JobStore;
pub use persistence::{JsonFileRepository, PersistedJob, QUEUE_FORMAT_VERSION, QueueRepository};
pub use stage::WAITING_FOR_TRIGGER;
pub use worker_pool::{CompletionHandler, JobHandle, TaskOutcome, WorkerPool};

pub(crate) use worker_pool::panic_message;
