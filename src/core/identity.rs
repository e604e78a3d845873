//! Local device identity.
//!
//! A stable `device_id` decouples a peer from its IP address:
//! `<hostname>-<user>-<uuid>`, where the uuid is generated on first run and
//! persisted to `device_id.json`. The identity is created once and never
//! regenerated while the file exists.

use crate::core::store::StateStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub hostname: String,
    pub user: String,
    pub uuid: Uuid,
    pub created_at: String,
}

impl DeviceIdentity {
    /// Load the persisted identity, or generate and persist a new one on
    /// first boot.
    pub fn load_or_create(store: &StateStore) -> Result<Self> {
        let path = store.identity_path();
        if let Some(identity) = store.read_json::<DeviceIdentity>(&path)? {
            return Ok(identity);
        }

        let hostname = local_hostname();
        let user = local_user();
        let uuid = Uuid::new_v4();
        let identity = DeviceIdentity {
            device_id: format!("{hostname}-{user}-{uuid}"),
            hostname,
            user,
            uuid,
            created_at: chrono::Local::now().to_rfc3339(),
        };
        store.write_json(&path, &identity)?;
        info!(
            event = "identity_created",
            device_id = %identity.device_id,
            "Generated new device identity"
        );
        Ok(identity)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let first = DeviceIdentity::load_or_create(&store).unwrap();
        let second = DeviceIdentity::load_or_create(&store).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.uuid, second.uuid);
    }

    #[test]
    fn device_id_embeds_host_user_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let id = DeviceIdentity::load_or_create(&store).unwrap();
        assert_eq!(
            id.device_id,
            format!("{}-{}-{}", id.hostname, id.user, id.uuid)
        );
    }

    #[test]
    fn deleting_the_file_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let first = DeviceIdentity::load_or_create(&store).unwrap();
        std::fs::remove_file(store.identity_path()).unwrap();
        let second = DeviceIdentity::load_or_create(&store).unwrap();

        assert_ne!(first.uuid, second.uuid);
    }
}
