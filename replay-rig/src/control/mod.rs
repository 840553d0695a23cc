//! Control surface of the scheduler.

mod service;
mod volume;

pub use service::{ControlResponse, ControlService};
pub use volume::{EXCLUDED_MOUNT_PREFIXES, VolumeInfo, collect_volumes};
