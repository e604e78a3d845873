//! Trusted-device management.
//!
//! The trusted set is what lets a peer skip the pairing code on reconnect.
//! Entries are keyed by `device_id`; re-trusting an already-trusted device
//! updates it in place, so `trust(x); trust(x)` equals `trust(x)`.
//!
//! The whole list lives in `trusted_devices.json` and is rewritten
//! atomically on every mutation. Unknown top-level fields in the file are
//! preserved across rewrites so older builds can read what newer builds
//! wrote.

use crate::core::store::StateStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One remembered peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub device_id: String,
    pub hostname: String,
    pub last_known_ip: String,
    pub trusted_at: String,
    pub last_seen: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustedFile {
    #[serde(default)]
    devices: Vec<PeerRecord>,
    /// Fields this build does not know about survive the rewrite.
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

pub struct TrustManager {
    store: StateStore,
    file: TrustedFile,
}

impl TrustManager {
    pub fn load(store: StateStore) -> Result<Self> {
        let file = store
            .read_json::<TrustedFile>(&store.trusted_path())?
            .unwrap_or_default();
        Ok(Self { store, file })
    }

    pub fn is_trusted(&self, device_id: &str) -> bool {
        !device_id.is_empty() && self.file.devices.iter().any(|d| d.device_id == device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<&PeerRecord> {
        self.file.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn all(&self) -> &[PeerRecord] {
        &self.file.devices
    }

    /// Add a device to the trusted set, or refresh an existing entry.
    pub fn trust(&mut self, device_id: &str, hostname: &str, ip: &str) -> Result<()> {
        if device_id.is_empty() {
            return Ok(());
        }
        let now = chrono::Local::now().to_rfc3339();
        if let Some(existing) = self
            .file
            .devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
        {
            existing.last_known_ip = ip.to_string();
            existing.last_seen = now;
            if !hostname.is_empty() {
                existing.hostname = hostname.to_string();
            }
        } else {
            info!(
                event = "device_trusted",
                device_id = %device_id,
                hostname = %hostname,
                "Added device to trusted set"
            );
            self.file.devices.push(PeerRecord {
                device_id: device_id.to_string(),
                hostname: hostname.to_string(),
                last_known_ip: ip.to_string(),
                trusted_at: now.clone(),
                last_seen: now,
            });
        }
        self.save()
    }

    /// Remove a device. Returns true if it was present.
    pub fn revoke(&mut self, device_id: &str) -> Result<bool> {
        let before = self.file.devices.len();
        self.file.devices.retain(|d| d.device_id != device_id);
        let removed = self.file.devices.len() < before;
        if removed {
            info!(event = "device_revoked", device_id = %device_id, "Removed device from trusted set");
            self.save()?;
        }
        Ok(removed)
    }

    /// Refresh `last_seen` and the last known IP after a successful
    /// connection. A no-op for devices that are not trusted.
    pub fn touch(&mut self, device_id: &str, ip: &str) -> Result<()> {
        if let Some(d) = self
            .file
            .devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
        {
            d.last_seen = chrono::Local::now().to_rfc3339();
            if !ip.is_empty() {
                d.last_known_ip = ip.to_string();
            }
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.store
            .write_json(&self.store.trusted_path(), &self.file)
            .map_err(|e| {
                warn!(event = "trusted_save_failure", error = %e, "Failed to persist trusted set");
                e
            })
    }
}
