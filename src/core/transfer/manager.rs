//! Transfer state manager.
//!
//! Owns the in-memory mirror of every open `TransferRecord` and serializes
//! all writes through the state store. Workers never touch record files
//! directly; they hold a `TransferHandle` and go through this interface.
//!
//! Flush policy: progress hits disk after `chunks_per_sync` newly completed
//! chunks, after `state_sync_interval` with dirty progress, immediately on
//! completion, and on `flush_all` at shutdown or disconnect.

use crate::core::store::StateStore;
use crate::core::transfer::record::{ChunkSet, Role, TransferDescriptor, TransferRecord};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Non-owning key to an open record. Cheap to clone; the manager keeps the
/// actual state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferHandle {
    role: Role,
    file_hash: String,
}

impl TransferHandle {
    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

struct Entry {
    record: TransferRecord,
    set: ChunkSet,
    dirty: u32,
    last_flush: Instant,
}

pub struct TransferStateManager {
    store: StateStore,
    chunks_per_sync: u32,
    sync_interval: Duration,
    open: HashMap<(Role, String), Entry>,
}

impl TransferStateManager {
    pub fn new(store: StateStore, chunks_per_sync: u32, sync_interval: Duration) -> Self {
        Self {
            store,
            chunks_per_sync,
            sync_interval,
            open: HashMap::new(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Open (or re-open) the record for a transfer.
    ///
    /// For any `(peer, file_hash)` there is at most one open handle; a
    /// second `open` for the same content returns the existing handle. A
    /// record on disk whose descriptor matches the requested one resumes
    /// with its persisted progress; a mismatching record (same hash file
    /// name collision, changed chunk size) is discarded and replaced.
    pub fn open(&mut self, descriptor: TransferDescriptor) -> Result<TransferHandle> {
        let key = (descriptor.role, descriptor.file_hash.clone());
        if let Some(entry) = self.open.get(&key) {
            if entry.record.descriptor.peer_device_id != descriptor.peer_device_id {
                bail!(
                    "transfer {} already open for a different peer",
                    descriptor.file_hash
                );
            }
            return Ok(TransferHandle {
                role: key.0,
                file_hash: key.1,
            });
        }

        let path = self
            .store
            .record_path(descriptor.role.dir(), &descriptor.file_hash);
        let record = match self.store.read_json::<TransferRecord>(&path)? {
            Some(existing) if content_eq(&existing.descriptor, &descriptor) => {
                info!(
                    event = "record_resumed",
                    file_hash = %descriptor.file_hash,
                    completed = existing.completed_chunks.len(),
                    total = descriptor.total_chunks,
                    "Loaded persisted progress"
                );
                existing
            }
            Some(_) => {
                warn!(
                    event = "record_discarded",
                    file_hash = %descriptor.file_hash,
                    "Persisted record does not match the announced descriptor, starting fresh"
                );
                self.store.remove(&path);
                TransferRecord::new(descriptor)
            }
            None => TransferRecord::new(descriptor),
        };

        let set = record.completed_set();
        let entry = Entry {
            record,
            set,
            dirty: 0,
            last_flush: Instant::now(),
        };
        self.store.write_json(&path, &entry.record)?;
        self.open.insert(key.clone(), entry);
        Ok(TransferHandle {
            role: key.0,
            file_hash: key.1,
        })
    }

    /// Mark one chunk complete. Returns true if the chunk was newly
    /// completed. Flushes per policy.
    pub fn mark_complete(&mut self, handle: &TransferHandle, index: u32) -> Result<bool> {
        let chunks_per_sync = self.chunks_per_sync;
        let sync_interval = self.sync_interval;
        let entry = self.entry_mut(handle)?;
        if !entry.set.insert(index) {
            return Ok(false);
        }
        entry.dirty += 1;
        let due = entry.dirty >= chunks_per_sync || entry.last_flush.elapsed() >= sync_interval;
        if due {
            self.flush(handle)?;
        }
        Ok(true)
    }

    /// Replace progress wholesale. Used when the receiver's resume set
    /// overrides the sender's local bookkeeping.
    pub fn adopt(&mut self, handle: &TransferHandle, set: ChunkSet) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        entry.set = set;
        self.flush(handle)
    }

    pub fn completed_set(&self, handle: &TransferHandle) -> Result<ChunkSet> {
        Ok(self.entry(handle)?.set.clone())
    }

    pub fn descriptor(&self, handle: &TransferHandle) -> Result<TransferDescriptor> {
        Ok(self.entry(handle)?.record.descriptor.clone())
    }

    pub fn is_complete(&self, handle: &TransferHandle) -> Result<bool> {
        Ok(self.entry(handle)?.set.is_complete())
    }

    /// Force the record to disk regardless of the flush thresholds.
    pub fn flush(&mut self, handle: &TransferHandle) -> Result<()> {
        let path = self
            .store
            .record_path(handle.role.dir(), &handle.file_hash);
        let entry = self.entry_mut(handle)?;
        let set = entry.set.clone();
        entry.record.set_completed(&set);
        entry.dirty = 0;
        entry.last_flush = Instant::now();
        let record = entry.record.clone();
        self.store.write_json(&path, &record)
    }

    /// Flush every dirty open record. Called on graceful shutdown and when
    /// a session fails.
    pub fn flush_all(&mut self) {
        let handles: Vec<TransferHandle> = self
            .open
            .iter()
            .filter(|(_, e)| e.dirty > 0)
            .map(|((role, hash), _)| TransferHandle {
                role: *role,
                file_hash: hash.clone(),
            })
            .collect();
        for h in handles {
            if let Err(e) = self.flush(&h) {
                warn!(event = "flush_failure", file_hash = %h.file_hash, error = %e, "Failed to flush record");
            }
        }
    }

    /// Terminal completion: the record file is destroyed and the handle
    /// closed.
    pub fn finish(&mut self, handle: &TransferHandle) -> Result<()> {
        let key = (handle.role, handle.file_hash.clone());
        if self.open.remove(&key).is_some() {
            let path = self.store.record_path(handle.role.dir(), &handle.file_hash);
            self.store.remove(&path);
            debug!(event = "record_finished", file_hash = %handle.file_hash, "Record removed after completion");
        }
        Ok(())
    }

    /// Drop the record and handle without completing (integrity failure).
    pub fn discard(&mut self, handle: &TransferHandle) {
        let key = (handle.role, handle.file_hash.clone());
        self.open.remove(&key);
        let path = self.store.record_path(handle.role.dir(), &handle.file_hash);
        self.store.remove(&path);
    }

    /// Close the handle but keep the record on disk for a later resume.
    pub fn release(&mut self, handle: &TransferHandle) {
        if self.flush(handle).is_err() {
            warn!(event = "release_flush_failure", file_hash = %handle.file_hash, "Failed final flush on release");
        }
        self.open.remove(&(handle.role, handle.file_hash.clone()));
    }

    /// All pending (incomplete) transfers for a peer and role, open or
    /// persisted from an earlier run.
    pub fn enumerate_pending(&self, peer_device_id: &str, role: Role) -> Vec<TransferDescriptor> {
        let mut out: Vec<TransferDescriptor> = self
            .open
            .values()
            .filter(|e| {
                e.record.descriptor.role == role
                    && e.record.descriptor.peer_device_id == peer_device_id
                    && !e.set.is_complete()
            })
            .map(|e| e.record.descriptor.clone())
            .collect();

        for hash in self.store.list_records(role.dir()) {
            if self.open.contains_key(&(role, hash.clone())) {
                continue;
            }
            let path = self.store.record_path(role.dir(), &hash);
            if let Ok(Some(record)) = self.store.read_json::<TransferRecord>(&path) {
                if record.descriptor.peer_device_id == peer_device_id {
                    out.push(record.descriptor);
                }
            }
        }
        out
    }

    fn entry(&self, handle: &TransferHandle) -> Result<&Entry> {
        match self.open.get(&(handle.role, handle.file_hash.clone())) {
            Some(e) => Ok(e),
            None => bail!("transfer {} is not open", handle.file_hash),
        }
    }

    fn entry_mut(&mut self, handle: &TransferHandle) -> Result<&mut Entry> {
        match self.open.get_mut(&(handle.role, handle.file_hash.clone())) {
            Some(e) => Ok(e),
            None => bail!("transfer {} is not open", handle.file_hash),
        }
    }
}

/// Wire-content equality: the fields a peer negotiates on, ignoring local
/// bookkeeping (peer id, role, creation time).
fn content_eq(a: &TransferDescriptor, b: &TransferDescriptor) -> bool {
    a.file_hash == b.file_hash
        && a.file_name == b.file_name
        && a.file_size == b.file_size
        && a.chunk_size == b.chunk_size
        && a.total_chunks == b.total_chunks
}
