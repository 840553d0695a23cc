//! Disk space of the mounted volumes.

use serde::{Deserialize, Serialize};
use sysinfo::Disks;

/// Mount points below these prefixes are system volumes and not reported.
pub const EXCLUDED_MOUNT_PREFIXES: &[&str] = &["/boot", "/init", "/dev", "/run", "/sys", "/usr"];

/// Size and free space of one mounted volume, in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub mount: String,
    pub size: u64,
    pub free_space: u64,
}

/// Collect the currently mounted data volumes.
///
/// Refreshing the disk list reads the mount table, so callers on the async
/// runtime should run this on a blocking thread.
pub fn collect_volumes() -> Vec<VolumeInfo> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .map(|disk| VolumeInfo {
            mount: disk.mount_point().to_string_lossy().into_owned(),
            size: disk.total_space(),
            free_space: disk.available_space(),
        })
        .filter(|volume| !is_excluded(&volume.mount))
        .collect()
}

fn is_excluded(mount: &str) -> bool {
    EXCLUDED_MOUNT_PREFIXES
        .iter()
        .any(|prefix| mount.starts_with(prefix))
}
