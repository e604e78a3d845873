//! Receiving half of a transfer.
//!
//! Writes arriving chunks straight to their final offset in a sparse
//! `.part` file, so memory stays bounded regardless of file size and
//! out-of-order duplicates after a reconnect are harmless. The record's
//! progress is never advanced past a chunk that has not hit the file.

use crate::core::error::{ShareError, ShareResult};
use crate::core::protocol::FileInfo;
use crate::core::store::StateStore;
use crate::core::transfer::manager::{TransferHandle, TransferStateManager};
use crate::core::transfer::record::{Role, TransferDescriptor};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

/// Outcome of a single `FILE_DATA` frame.
#[derive(Debug, PartialEq, Eq)]
pub enum DataOutcome {
    /// Chunk written and recorded; ACK it.
    Written,
    /// Already had it; the write was skipped but it is ACKed again so the
    /// sender's bookkeeping converges.
    Duplicate,
}

pub struct ChunkReceiver {
    handle: TransferHandle,
    descriptor: TransferDescriptor,
    part: tokio::fs::File,
    part_path: PathBuf,
    download_dir: PathBuf,
}

impl ChunkReceiver {
    /// React to a `FILE_INFO`: open or resume the record, pre-allocate the
    /// sparse `.part` file, and report the already-completed runs (empty
    /// for a fresh transfer).
    pub async fn start(
        manager: &Arc<Mutex<TransferStateManager>>,
        download_dir: &Path,
        info: &FileInfo,
        peer_device_id: &str,
    ) -> ShareResult<(Self, Vec<(u32, u32)>)> {
        let expected = crate::core::transfer::record::total_chunks(info.file_size, info.chunk_size);
        if info.chunk_size == 0 || info.total_chunks != expected {
            return Err(ShareError::protocol(format!(
                "file_info announces {} chunks for {} bytes of {}-byte chunks",
                info.total_chunks, info.file_size, info.chunk_size
            )));
        }

        let descriptor = TransferDescriptor {
            file_hash: info.file_hash.clone(),
            file_name: info.file_name.clone(),
            file_size: info.file_size,
            chunk_size: info.chunk_size,
            total_chunks: info.total_chunks,
            peer_device_id: peer_device_id.to_string(),
            role: Role::Receiving,
            created_at: chrono::Local::now().to_rfc3339(),
        };

        let (handle, runs, part_path) = {
            let mut mgr = manager.lock().expect("transfer manager poisoned");
            let handle = mgr
                .open(descriptor.clone())
                .map_err(|e| ShareError::State(e.to_string()))?;
            let runs = mgr
                .completed_set(&handle)
                .map_err(|e| ShareError::State(e.to_string()))?
                .to_runs();
            let store: &StateStore = mgr.store();
            let part_path = store.part_path(&info.file_hash);
            (handle, runs, part_path)
        };

        let part = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part_path)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        // Sparse pre-allocation to the final size. Also heals a stale .part
        // left behind by a transfer of different length.
        let meta = part
            .metadata()
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        if meta.len() != descriptor.file_size {
            part.set_len(descriptor.file_size)
                .await
                .map_err(|e| ShareError::State(e.to_string()))?;
        }

        info!(
            event = "receive_started",
            file_hash = %descriptor.file_hash,
            file_name = %descriptor.file_name,
            file_size = descriptor.file_size,
            resumed_chunks = runs.iter().map(|(s, e)| e - s).sum::<u32>(),
            "Receiving transfer opened"
        );

        Ok((
            Self {
                handle,
                descriptor,
                part,
                part_path,
                download_dir: download_dir.to_path_buf(),
            },
            runs,
        ))
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn file_hash(&self) -> &str {
        &self.descriptor.file_hash
    }

    /// Handle one `FILE_DATA` frame. Duplicates are discarded but still
    /// acknowledged.
    pub async fn on_data(
        &mut self,
        manager: &Arc<Mutex<TransferStateManager>>,
        index: u32,
        data: &[u8],
    ) -> ShareResult<DataOutcome> {
        if index >= self.descriptor.total_chunks {
            return Err(ShareError::protocol(format!(
                "chunk index {} out of range (total {})",
                index, self.descriptor.total_chunks
            )));
        }
        let expected = self.descriptor.chunk_len(index);
        if data.len() as u64 != expected {
            return Err(ShareError::protocol(format!(
                "chunk {} carries {} bytes, expected {}",
                index,
                data.len(),
                expected
            )));
        }

        {
            let mgr = manager.lock().expect("transfer manager poisoned");
            if mgr
                .completed_set(&self.handle)
                .map_err(|e| ShareError::State(e.to_string()))?
                .contains(index)
            {
                return Ok(DataOutcome::Duplicate);
            }
        }

        self.part
            .seek(SeekFrom::Start(self.descriptor.chunk_offset(index)))
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        self.part
            .write_all(data)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;

        // Only after the bytes are in the file does the progress advance.
        manager
            .lock()
            .expect("transfer manager poisoned")
            .mark_complete(&self.handle, index)
            .map_err(|e| ShareError::State(e.to_string()))?;

        Ok(DataOutcome::Written)
    }

    pub fn is_complete(&self, manager: &Arc<Mutex<TransferStateManager>>) -> bool {
        manager
            .lock()
            .expect("transfer manager poisoned")
            .is_complete(&self.handle)
            .unwrap_or(false)
    }

    /// Verify the reassembled file against the descriptor's content hash,
    /// move it to its final name, and destroy the record.
    ///
    /// On hash mismatch both the record and the `.part` file are deleted;
    /// the transfer must restart from scratch.
    pub async fn finalize(
        mut self,
        manager: &Arc<Mutex<TransferStateManager>>,
    ) -> ShareResult<PathBuf> {
        if !self.is_complete(manager) {
            return Err(ShareError::protocol(format!(
                "file_complete for {} before all chunks arrived",
                self.descriptor.file_hash
            )));
        }

        self.part
            .flush()
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        self.part
            .sync_all()
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        drop(self.part);

        let actual = crate::core::transfer::file_hash(&self.part_path)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        if actual != self.descriptor.file_hash {
            warn!(
                event = "integrity_failure",
                file_hash = %self.descriptor.file_hash,
                actual = %actual,
                "Reassembled file does not match the announced hash"
            );
            let mut mgr = manager.lock().expect("transfer manager poisoned");
            mgr.discard(&self.handle);
            mgr.store().remove(&self.part_path);
            return Err(ShareError::Integrity("content hash mismatch".into()));
        }

        let dest = unique_destination(&self.download_dir, &self.descriptor.file_name);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ShareError::State(e.to_string()))?;
        }
        tokio::fs::rename(&self.part_path, &dest)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;

        manager
            .lock()
            .expect("transfer manager poisoned")
            .finish(&self.handle)
            .map_err(|e| ShareError::State(e.to_string()))?;

        info!(
            event = "receive_complete",
            file_hash = %self.descriptor.file_hash,
            path = %dest.display(),
            "File received and verified"
        );
        Ok(dest)
    }

    /// Close the handle but keep record and `.part` for a later resume.
    pub fn release(self, manager: &Arc<Mutex<TransferStateManager>>) {
        manager
            .lock()
            .expect("transfer manager poisoned")
            .release(&self.handle);
    }
}

/// Resolve the destination for a received file, dodging collisions with a
/// `" (n)"` suffix. Path components that would escape the download
/// directory are dropped.
fn unique_destination(download_dir: &Path, file_name: &str) -> PathBuf {
    let mut relative = PathBuf::new();
    for component in Path::new(file_name).components() {
        if let Component::Normal(part) = component {
            relative.push(part);
        }
    }
    if relative.as_os_str().is_empty() {
        relative = PathBuf::from("received.bin");
    }

    let candidate = download_dir.join(&relative);
    if !candidate.exists() {
        return candidate;
    }

    let stem = candidate
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("received");
    let ext = candidate.extension().and_then(|s| s.to_str());
    let parent = candidate.parent().unwrap_or(download_dir).to_path_buf();
    let mut counter = 1;
    loop {
        let name = match ext {
            Some(ext) => format!("{stem} ({counter}).{ext}"),
            None => format!("{stem} ({counter})"),
        };
        let next = parent.join(name);
        if !next.exists() {
            return next;
        }
        counter += 1;
    }
}
