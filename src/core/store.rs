//! Persistent state store.
//!
//! Owns the on-disk layout under `<download_dir>/.lan_share/`:
//!
//! - `device_id.json` — local identity, written once
//! - `trusted_devices.json` — the trusted peer set
//! - `sending/<hash>.json` / `receiving/<hash>.json` — transfer records
//! - `receiving/<hash>.part` — sparse in-flight data files
//!
//! Every JSON write is atomic (temp + fsync + rename). Reads recover an
//! orphaned `.tmp` left by a crash mid-rename. A file that no longer parses
//! is quarantined with a `.corrupt` suffix so a fresh record can take its
//! place without silently destroying evidence.

use crate::utils::atomic_write::{atomic_write, promote_orphan};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the state layout rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sending"))
            .with_context(|| format!("creating {}", root.display()))?;
        std::fs::create_dir_all(root.join("receiving"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity_path(&self) -> PathBuf {
        self.root.join("device_id.json")
    }

    pub fn trusted_path(&self) -> PathBuf {
        self.root.join("trusted_devices.json")
    }

    pub fn record_path(&self, dir: &str, file_hash: &str) -> PathBuf {
        self.root.join(dir).join(format!("{file_hash}.json"))
    }

    pub fn part_path(&self, file_hash: &str) -> PathBuf {
        self.root.join("receiving").join(format!("{file_hash}.part"))
    }

    /// Read and parse a JSON file.
    ///
    /// Returns `Ok(None)` when the file is absent, or when it exists but
    /// cannot be parsed — in which case it is quarantined first so the
    /// caller can start a fresh record.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        promote_orphan(path);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        match serde_json::from_str::<T>(&content) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                error!(
                    event = "record_quarantined",
                    path = %path.display(),
                    error = %e,
                    "Unparseable state file, quarantining"
                );
                self.quarantine(path);
                Ok(None)
            }
        }
    }

    /// Atomically write a JSON file.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        atomic_write(path, content.as_bytes())?;
        debug!(event = "state_written", path = %path.display());
        Ok(())
    }

    /// Remove a state file if present. Absence is not an error.
    pub fn remove(&self, path: &Path) {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(
                    event = "state_remove_failure",
                    path = %path.display(),
                    error = %e,
                    "Failed to remove state file"
                );
            }
        }
    }

    /// Rename a damaged file to `<path>.corrupt` instead of deleting it.
    fn quarantine(&self, path: &Path) {
        let mut os = path.as_os_str().to_os_string();
        os.push(".corrupt");
        if let Err(e) = std::fs::rename(path, PathBuf::from(os)) {
            warn!(
                event = "quarantine_failure",
                path = %path.display(),
                error = %e,
                "Could not quarantine corrupt state file"
            );
        }
    }

    /// List the file hashes with a persisted record in `sending/` or
    /// `receiving/`.
    pub fn list_records(&self, dir: &str) -> Vec<String> {
        let mut hashes = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.root.join(dir)) else {
            return hashes;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    hashes.push(stem.to_string());
                }
            }
        }
        hashes.sort();
        hashes
    }
}
