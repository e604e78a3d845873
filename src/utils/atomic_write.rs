//! Atomic file write utility.
//!
//! Single implementation of the write-to-temp-then-rename pattern used for
//! all persistent state files (transfer records, trusted devices, identity).
//!
//! Invariants:
//! - Content goes to `<path>.tmp` first and is fsynced before the rename.
//! - An atomic rename replaces the target; on rename failure the temp file
//!   is cleaned up to avoid stale artifacts.
//! - Parent directories are created if absent.
//! - A crash between write and rename leaves an orphaned `.tmp` that
//!   `promote_orphan` recovers on the next read.

use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// The sibling temp path for `path`: `<path>.tmp`.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// # Errors
/// Returns an error if the temp file cannot be written or the rename fails.
/// On rename failure, attempts to clean up the temp file.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let tmp = tmp_path(path);

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()
    };
    write().map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp);
        e
    })?;

    Ok(())
}

/// Recover from a crash that happened mid-rename: if `path` is absent but
/// its `.tmp` sibling exists, promote the temp file to the real name.
///
/// Returns true if a promotion happened.
pub fn promote_orphan(path: &Path) -> bool {
    let tmp = tmp_path(path);
    if !path.exists() && tmp.exists() && std::fs::rename(&tmp, path).is_ok() {
        info!(
            event = "tmp_promoted",
            path = %path.display(),
            "Promoted orphaned temp file left by an interrupted write"
        );
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn no_temp_file_remains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"data").unwrap();
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn promotes_orphaned_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // Simulate a crash after the temp write but before the rename.
        std::fs::write(tmp_path(&path), b"rescued").unwrap();
        assert!(promote_orphan(&path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "rescued");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn promotion_never_clobbers_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"current").unwrap();
        std::fs::write(tmp_path(&path), b"stale").unwrap();
        assert!(!promote_orphan(&path));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "current");
    }
}
