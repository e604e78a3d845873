//! Send jobs: what the embedder hands to `send()`.
//!
//! A single `send(path, peer)` call becomes one job batch. A file path is a
//! batch of one; a directory expands into one file job per regular file,
//! relative paths preserved, with progress aggregated over the whole batch.

use crate::core::error::ErrorKind;
use crate::utils::sos::SignalOfStop;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Opaque identifier of a job batch.
pub type JobHandle = Uuid;

/// Lifecycle of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Active,
    Reconnecting,
    Complete,
    Failed(ErrorKind),
    Cancelled,
    /// Reconnection exhausted; records stay on disk for a manual retry.
    Stalled,
}

/// Aggregated progress, shared between the transfer workers and the
/// embedder-facing `progress()` query.
#[derive(Debug)]
pub struct JobShared {
    pub bytes_total: AtomicU64,
    pub bytes_done: AtomicU64,
    state: Mutex<JobState>,
}

impl JobShared {
    pub fn new(bytes_total: u64) -> Self {
        Self {
            bytes_total: AtomicU64::new(bytes_total),
            bytes_done: AtomicU64::new(0),
            state: Mutex::new(JobState::Queued),
        }
    }

    pub fn state(&self) -> JobState {
        self.state.lock().expect("job state poisoned").clone()
    }

    pub fn set_state(&self, state: JobState) {
        *self.state.lock().expect("job state poisoned") = state;
    }

    pub fn snapshot(&self) -> JobProgress {
        JobProgress {
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            state: self.state(),
        }
    }
}

/// What `progress(job_handle)` returns.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub state: JobState,
}

/// One file to send. Directories expand into several of these sharing the
/// same batch id and `JobShared`.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub job_id: JobHandle,
    /// Absolute path of the source on this machine.
    pub path: PathBuf,
    /// Name announced on the wire; keeps the relative path for files that
    /// came from a directory batch.
    pub file_name: String,
    pub size: u64,
    pub shared: Arc<JobShared>,
    pub cancel: SignalOfStop,
}

/// Expand a path into a batch of file jobs.
///
/// Regular file: a batch of one. Directory: every regular file below it, in
/// sorted order so the FIFO queue is deterministic, named
/// `<dirname>/<relative path>`.
pub fn expand(path: &Path, job_id: JobHandle) -> Result<(Vec<SendJob>, Arc<JobShared>)> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("reading metadata of {}", path.display()))?;

    let mut files: Vec<(PathBuf, String, u64)> = Vec::new();
    if meta.is_file() {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("source file has no usable name")?
            .to_string();
        files.push((path.to_path_buf(), name, meta.len()));
    } else if meta.is_dir() {
        let dirname = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("source directory has no usable name")?
            .to_string();
        collect_files(path, Path::new(&dirname), &mut files)?;
        if files.is_empty() {
            bail!("directory {} contains no files", path.display());
        }
        files.sort_by(|a, b| a.1.cmp(&b.1));
    } else {
        bail!("{} is neither a file nor a directory", path.display());
    }

    let total: u64 = files.iter().map(|(_, _, size)| size).sum();
    let shared = Arc::new(JobShared::new(total));
    let cancel = SignalOfStop::new();
    let jobs = files
        .into_iter()
        .map(|(path, file_name, size)| SendJob {
            job_id,
            path,
            file_name,
            size,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
        })
        .collect();
    Ok((jobs, shared))
}

fn collect_files(
    dir: &Path,
    prefix: &Path,
    out: &mut Vec<(PathBuf, String, u64)>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let rel = prefix.join(name);
        if meta.is_dir() {
            collect_files(&path, &rel, out)?;
        } else if meta.is_file() {
            let wire_name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((path, wire_name, meta.len()));
        }
    }
    Ok(())
}
