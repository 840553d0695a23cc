//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / parent-directory checks.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure the parent directory of a file path exists with a custom operation label.
pub async fn ensure_parent_dir_with_op(op: &'static str, path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    ensure_dir_all_with_op(op, parent).await
}

/// Ensure a directory exists (synchronous variant).
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))
}

/// Sibling temp path used while writing `path` atomically.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `contents` to `path` so readers never observe a partial file.
///
/// The data goes to a sibling temp file first, is synced, and then renamed
/// over the destination.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dir_with_op("creating directory", path).await?;

    let tmp = temp_path(path);
    let write = async {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await
    };
    if let Err(e) = write.await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error("writing", &tmp, e));
    }

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error("renaming", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_write_atomic_reports_path_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be replaced by a file.
        let target = dir.path().join("occupied");
        std::fs::create_dir_all(target.join("child")).unwrap();

        let err = write_atomic(&target, b"data").await.unwrap_err();
        assert!(matches!(err, Error::IoPath { .. }));
    }

    #[test]
    fn test_ensure_dir_all_sync() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir_all_sync(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
