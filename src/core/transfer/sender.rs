//! Sending half of a transfer.
//!
//! Stop-and-wait: at most one unacknowledged chunk in flight. Chunks go out
//! in ascending index order, skipping whatever the completed set already
//! covers. The receiver is authoritative about progress — a `FILE_RESUME`
//! arriving at any point replaces the local set wholesale, including one
//! that races the first data frames after a reconnect.

use crate::core::config::Config;
use crate::core::error::{ShareError, ShareResult};
use crate::core::protocol::{
    FileComplete, FileInfo, FileResumeOk, Message,
};
use crate::core::transfer::manager::{TransferHandle, TransferStateManager};
use crate::core::transfer::record::{ChunkSet, Role, TransferDescriptor};
use crate::utils::sos::SignalOfStop;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct ChunkSender {
    handle: TransferHandle,
    descriptor: TransferDescriptor,
    source: tokio::fs::File,
}

/// Classify an ERROR frame from the peer: its own disk trouble and hash
/// mismatches are transfer-scoped; everything else is a protocol breach.
fn peer_error(e: crate::core::protocol::ErrorMsg) -> ShareError {
    match e.kind.as_str() {
        "integrity" => ShareError::Integrity(e.detail),
        "state" => ShareError::State(e.detail),
        _ => ShareError::Protocol(format!("{}: {}", e.kind, e.detail)),
    }
}

enum AckWait {
    /// The awaited chunk is covered.
    Acked,
    /// Nothing decisive arrived before the deadline.
    Timeout,
}

impl ChunkSender {
    /// Hash the source, open (or resume) the sending record, and open the
    /// file for chunk reads. The hash in the descriptor is final — it is
    /// what the receiver will verify against.
    pub async fn prepare(
        manager: &Arc<Mutex<TransferStateManager>>,
        chunk_size: u32,
        path: &Path,
        file_name: String,
        peer_device_id: &str,
    ) -> ShareResult<Self> {
        let file_hash = crate::core::transfer::file_hash(path)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?
            .len();

        let descriptor = TransferDescriptor::new(
            file_hash,
            file_name,
            file_size,
            chunk_size,
            peer_device_id.to_string(),
            Role::Sending,
        );
        let handle = manager
            .lock()
            .expect("transfer manager poisoned")
            .open(descriptor.clone())
            .map_err(|e| ShareError::State(e.to_string()))?;

        let source = tokio::fs::File::open(path)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;

        info!(
            event = "send_prepared",
            file_hash = %descriptor.file_hash,
            file_name = %descriptor.file_name,
            file_size,
            total_chunks = descriptor.total_chunks,
            "Sending transfer opened"
        );
        Ok(Self {
            handle,
            descriptor,
            source,
        })
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn file_info(&self) -> FileInfo {
        FileInfo {
            file_hash: self.descriptor.file_hash.clone(),
            file_name: self.descriptor.file_name.clone(),
            file_size: self.descriptor.file_size,
            chunk_size: self.descriptor.chunk_size,
            total_chunks: self.descriptor.total_chunks,
        }
    }

    /// Drive the transfer to completion over the session's outbox/inbox.
    ///
    /// `on_progress` is called with `(bytes_done, bytes_total)` after every
    /// acknowledged chunk. Returns once `FILE_COMPLETE_ACK` lands and the
    /// record is destroyed; any transport-shaped failure leaves the record
    /// for the reconnect supervisor. An integrity failure destroys the
    /// record, since the receiver has already thrown its half away and a
    /// retry must start from scratch.
    pub async fn run(
        self,
        manager: &Arc<Mutex<TransferStateManager>>,
        outbox: &mpsc::Sender<Message>,
        frames: &mut mpsc::Receiver<Message>,
        cfg: &Config,
        cancel: &SignalOfStop,
        on_progress: impl FnMut(u64, u64),
    ) -> ShareResult<()> {
        let handle = self.handle.clone();
        let result = self
            .run_inner(manager, outbox, frames, cfg, cancel, on_progress)
            .await;
        if matches!(result, Err(ShareError::Integrity(_))) {
            manager
                .lock()
                .expect("transfer manager poisoned")
                .discard(&handle);
        }
        result
    }

    async fn run_inner(
        mut self,
        manager: &Arc<Mutex<TransferStateManager>>,
        outbox: &mpsc::Sender<Message>,
        frames: &mut mpsc::Receiver<Message>,
        cfg: &Config,
        cancel: &SignalOfStop,
        mut on_progress: impl FnMut(u64, u64),
    ) -> ShareResult<()> {
        self.send(outbox, Message::FileInfo(self.file_info())).await?;
        self.await_info_ack(manager, outbox, frames, cfg).await?;

        loop {
            if cancel.cancelled() {
                manager
                    .lock()
                    .expect("transfer manager poisoned")
                    .flush(&self.handle)
                    .ok();
                return Err(ShareError::Cancelled);
            }

            let next = {
                let mgr = manager.lock().expect("transfer manager poisoned");
                mgr.completed_set(&self.handle)
                    .map_err(|e| ShareError::State(e.to_string()))?
                    .missing()
                    .next()
            };
            let Some(index) = next else { break };

            let data = self.read_chunk(index).await?;
            let mut attempt = 0u32;
            loop {
                self.send(
                    outbox,
                    Message::FileData {
                        index,
                        data: data.clone(),
                    },
                )
                .await?;

                match self
                    .await_chunk_ack(manager, outbox, frames, cfg, index)
                    .await?
                {
                    AckWait::Acked => break,
                    AckWait::Timeout => {
                        attempt += 1;
                        if attempt > cfg.max_retry {
                            warn!(
                                event = "chunk_retries_exhausted",
                                file_hash = %self.descriptor.file_hash,
                                chunk = index,
                                attempts = attempt,
                                "No ACK after retries, raising recoverable error"
                            );
                            manager
                                .lock()
                                .expect("transfer manager poisoned")
                                .flush(&self.handle)
                                .ok();
                            return Err(ShareError::Transport(format!(
                                "no ACK for chunk {index} after {attempt} attempts"
                            )));
                        }
                        debug!(
                            event = "chunk_retry",
                            chunk = index,
                            attempt,
                            "ACK timeout, resending chunk"
                        );
                    }
                }
            }

            {
                let mut mgr = manager.lock().expect("transfer manager poisoned");
                mgr.mark_complete(&self.handle, index)
                    .map_err(|e| ShareError::State(e.to_string()))?;
                let done = mgr
                    .completed_set(&self.handle)
                    .map_err(|e| ShareError::State(e.to_string()))?
                    .len();
                on_progress(
                    (u64::from(done) * u64::from(self.descriptor.chunk_size))
                        .min(self.descriptor.file_size),
                    self.descriptor.file_size,
                );
            }
        }

        // Every chunk acknowledged (or there were none): close the loop.
        self.send(
            outbox,
            Message::FileComplete(FileComplete {
                file_hash: self.descriptor.file_hash.clone(),
            }),
        )
        .await?;
        self.await_complete_ack(frames, cfg).await?;

        manager
            .lock()
            .expect("transfer manager poisoned")
            .finish(&self.handle)
            .map_err(|e| ShareError::State(e.to_string()))?;
        on_progress(self.descriptor.file_size, self.descriptor.file_size);
        info!(
            event = "send_complete",
            file_hash = %self.descriptor.file_hash,
            "Transfer acknowledged by receiver"
        );
        Ok(())
    }

    async fn read_chunk(&mut self, index: u32) -> ShareResult<Vec<u8>> {
        let len = self.descriptor.chunk_len(index) as usize;
        let mut data = vec![0u8; len];
        self.source
            .seek(SeekFrom::Start(self.descriptor.chunk_offset(index)))
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        self.source
            .read_exact(&mut data)
            .await
            .map_err(|e| ShareError::State(e.to_string()))?;
        Ok(data)
    }

    async fn send(&self, outbox: &mpsc::Sender<Message>, msg: Message) -> ShareResult<()> {
        outbox
            .send(msg)
            .await
            .map_err(|_| ShareError::Transport("session outbox closed".into()))
    }

    /// Wait for the receiver to answer `FILE_INFO`. Either a bare
    /// `FILE_INFO_ACK` (fresh transfer, proceed from local progress) or a
    /// `FILE_RESUME` whose completed set overrides ours.
    async fn await_info_ack(
        &self,
        manager: &Arc<Mutex<TransferStateManager>>,
        outbox: &mpsc::Sender<Message>,
        frames: &mut mpsc::Receiver<Message>,
        cfg: &Config,
    ) -> ShareResult<()> {
        let deadline = tokio::time::Instant::now() + cfg.ack_timeout;
        loop {
            let msg = timeout(deadline - tokio::time::Instant::now(), frames.recv())
                .await
                .map_err(|_| ShareError::Transport("no answer to file_info".into()))?
                .ok_or_else(|| ShareError::Transport("session closed".into()))?;
            match msg {
                Message::FileInfoAck(ack) if ack.file_hash == self.descriptor.file_hash => {
                    return Ok(());
                }
                Message::FileResume(resume) if resume.file_hash == self.descriptor.file_hash => {
                    self.adopt_resume(manager, outbox, &resume.runs).await?;
                    return Ok(());
                }
                Message::Error(e) => return Err(peer_error(e)),
                other => {
                    debug!(event = "frame_ignored", frame = other.name(), "Ignoring frame while awaiting info ack");
                }
            }
        }
    }

    async fn adopt_resume(
        &self,
        manager: &Arc<Mutex<TransferStateManager>>,
        outbox: &mpsc::Sender<Message>,
        runs: &[(u32, u32)],
    ) -> ShareResult<()> {
        let theirs = ChunkSet::from_runs(self.descriptor.total_chunks, runs);
        info!(
            event = "resume_adopted",
            file_hash = %self.descriptor.file_hash,
            completed = theirs.len(),
            total = self.descriptor.total_chunks,
            "Receiver progress adopted as authoritative"
        );
        manager
            .lock()
            .expect("transfer manager poisoned")
            .adopt(&self.handle, theirs)
            .map_err(|e| ShareError::State(e.to_string()))?;
        self.send(
            outbox,
            Message::FileResumeOk(FileResumeOk {
                file_hash: self.descriptor.file_hash.clone(),
            }),
        )
        .await
    }

    /// Wait for `index` to be acknowledged, absorbing batch ACKs, late
    /// duplicates, and mid-stream resume overrides along the way.
    async fn await_chunk_ack(
        &self,
        manager: &Arc<Mutex<TransferStateManager>>,
        outbox: &mpsc::Sender<Message>,
        frames: &mut mpsc::Receiver<Message>,
        cfg: &Config,
        index: u32,
    ) -> ShareResult<AckWait> {
        let deadline = tokio::time::Instant::now() + cfg.ack_timeout;
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            let msg = match timeout(remaining, frames.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(ShareError::Transport("session closed".into())),
                Err(_) => return Ok(AckWait::Timeout),
            };
            match msg {
                Message::FileAck(ack) if ack.file_hash == self.descriptor.file_hash => {
                    if ack.chunk_index == index {
                        return Ok(AckWait::Acked);
                    }
                    // Late duplicate from a previous life of this transfer.
                    let mut mgr = manager.lock().expect("transfer manager poisoned");
                    mgr.mark_complete(&self.handle, ack.chunk_index)
                        .map_err(|e| ShareError::State(e.to_string()))?;
                }
                Message::FileAckBatch(batch) if batch.file_hash == self.descriptor.file_hash => {
                    let covered = {
                        let mut mgr = manager.lock().expect("transfer manager poisoned");
                        for &(start, end) in &batch.runs {
                            for i in start..end.min(self.descriptor.total_chunks) {
                                mgr.mark_complete(&self.handle, i)
                                    .map_err(|e| ShareError::State(e.to_string()))?;
                            }
                        }
                        batch.runs.iter().any(|&(s, e)| index >= s && index < e)
                    };
                    if covered {
                        return Ok(AckWait::Acked);
                    }
                }
                Message::FileResume(resume) if resume.file_hash == self.descriptor.file_hash => {
                    self.adopt_resume(manager, outbox, &resume.runs).await?;
                    let covered = manager
                        .lock()
                        .expect("transfer manager poisoned")
                        .completed_set(&self.handle)
                        .map_err(|e| ShareError::State(e.to_string()))?
                        .contains(index);
                    if covered {
                        return Ok(AckWait::Acked);
                    }
                }
                Message::Error(e) => return Err(peer_error(e)),
                other => {
                    debug!(event = "frame_ignored", frame = other.name(), "Ignoring frame while awaiting chunk ack");
                }
            }
        }
    }

    async fn await_complete_ack(
        &self,
        frames: &mut mpsc::Receiver<Message>,
        cfg: &Config,
    ) -> ShareResult<()> {
        let deadline = tokio::time::Instant::now() + cfg.ack_timeout;
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            let msg = match timeout(remaining, frames.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(ShareError::Transport("session closed".into())),
                Err(_) => {
                    return Err(ShareError::Transport(
                        "no acknowledgement of file_complete".into(),
                    ))
                }
            };
            match msg {
                Message::FileCompleteAck(ack) if ack.file_hash == self.descriptor.file_hash => {
                    return Ok(());
                }
                Message::Error(e) => return Err(peer_error(e)),
                other => {
                    debug!(event = "frame_ignored", frame = other.name(), "Ignoring frame while awaiting completion ack");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{FileAck, FileCompleteAck, FileInfoAck, FileResume};
    use crate::core::store::StateStore;
    use crate::core::transfer::receiver::ChunkReceiver;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Side {
        _dir: tempfile::TempDir,
        manager: Arc<Mutex<TransferStateManager>>,
        download_dir: PathBuf,
    }

    fn side() -> Side {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();
        let store = StateStore::open(dir.path().join("state")).unwrap();
        let manager = Arc::new(Mutex::new(TransferStateManager::new(
            store,
            50,
            Duration::from_secs(3600),
        )));
        Side {
            _dir: dir,
            manager,
            download_dir,
        }
    }

    fn test_config() -> Config {
        Config {
            chunk_size: 1024,
            ack_timeout: Duration::from_millis(400),
            max_retry: 2,
            ..Config::default()
        }
    }

    /// A loopback receiver: answers the sender the way a session does,
    /// counting data frames.
    fn spawn_receiver(
        rx_side: &Side,
        mut from_sender: mpsc::Receiver<Message>,
        to_sender: mpsc::Sender<Message>,
        data_frames: Arc<AtomicU32>,
    ) -> tokio::task::JoinHandle<Option<PathBuf>> {
        let manager = Arc::clone(&rx_side.manager);
        let download_dir = rx_side.download_dir.clone();
        tokio::spawn(async move {
            let mut receiver: Option<ChunkReceiver> = None;
            let mut final_path = None;
            while let Some(msg) = from_sender.recv().await {
                match msg {
                    Message::FileInfo(info) => {
                        let (rx, runs) =
                            ChunkReceiver::start(&manager, &download_dir, &info, "peer-sender")
                                .await
                                .unwrap();
                        // Resume ahead of the ack, exactly like the session.
                        if !runs.is_empty() {
                            to_sender
                                .send(Message::FileResume(FileResume {
                                    file_hash: info.file_hash.clone(),
                                    runs,
                                }))
                                .await
                                .unwrap();
                        }
                        to_sender
                            .send(Message::FileInfoAck(FileInfoAck {
                                file_hash: info.file_hash.clone(),
                            }))
                            .await
                            .unwrap();
                        receiver = Some(rx);
                    }
                    Message::FileData { index, data } => {
                        data_frames.fetch_add(1, Ordering::SeqCst);
                        let rx = receiver.as_mut().unwrap();
                        rx.on_data(&manager, index, &data).await.unwrap();
                        let hash = rx.file_hash().to_string();
                        to_sender
                            .send(Message::FileAck(FileAck {
                                file_hash: hash,
                                chunk_index: index,
                            }))
                            .await
                            .unwrap();
                    }
                    Message::FileComplete(c) => {
                        let rx = receiver.take().unwrap();
                        final_path = Some(rx.finalize(&manager).await.unwrap());
                        to_sender
                            .send(Message::FileCompleteAck(FileCompleteAck {
                                file_hash: c.file_hash,
                            }))
                            .await
                            .unwrap();
                        break;
                    }
                    Message::FileResumeOk(_) => {}
                    other => panic!("receiver got unexpected frame {}", other.name()),
                }
            }
            final_path
        })
    }

    async fn source_file(dir: &tempfile::TempDir, data: &[u8]) -> PathBuf {
        let path = dir.path().join("source.bin");
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn full_transfer_roundtrip() {
        let tx_side = side();
        let rx_side = side();
        let cfg = test_config();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 233) as u8).collect();
        let src = source_file(&tx_side._dir, &data).await;

        let sender = ChunkSender::prepare(
            &tx_side.manager,
            cfg.chunk_size,
            &src,
            "source.bin".into(),
            "peer-receiver",
        )
        .await
        .unwrap();
        let hash = sender.descriptor().file_hash.clone();

        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, mut in_rx) = mpsc::channel(16);
        let frames = Arc::new(AtomicU32::new(0));
        let receiver_task = spawn_receiver(&rx_side, out_rx, in_tx, Arc::clone(&frames));

        let mut last_progress = (0, 0);
        sender
            .run(
                &tx_side.manager,
                &out_tx,
                &mut in_rx,
                &cfg,
                &SignalOfStop::new(),
                |done, total| last_progress = (done, total),
            )
            .await
            .unwrap();

        let final_path = receiver_task.await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), data);
        assert_eq!(frames.load(Ordering::SeqCst), 10);
        assert_eq!(last_progress, (10_000, 10_000));

        // Both records are destroyed on completion.
        assert!(tx_side
            .manager
            .lock()
            .unwrap()
            .enumerate_pending("peer-receiver", Role::Sending)
            .is_empty());
        assert!(!rx_side
            .manager
            .lock()
            .unwrap()
            .store()
            .record_path("receiving", &hash)
            .exists());
    }

    #[tokio::test]
    async fn resume_sends_only_missing_chunks() {
        let tx_side = side();
        let rx_side = side();
        let cfg = test_config();
        let data: Vec<u8> = (0..10_240u32).map(|i| (i % 241) as u8).collect();
        let src = source_file(&tx_side._dir, &data).await;

        let sender = ChunkSender::prepare(
            &tx_side.manager,
            cfg.chunk_size,
            &src,
            "source.bin".into(),
            "peer-receiver",
        )
        .await
        .unwrap();

        // The receiver already holds chunks 0..4 from a previous run that
        // was killed.
        {
            let info = sender.file_info();
            let (mut rx, _) =
                ChunkReceiver::start(&rx_side.manager, &rx_side.download_dir, &info, "peer-sender")
                    .await
                    .unwrap();
            for i in 0..4u32 {
                let range = (i as usize * 1024)..((i as usize + 1) * 1024);
                rx.on_data(&rx_side.manager, i, &data[range]).await.unwrap();
            }
            rx.release(&rx_side.manager);
        }

        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, mut in_rx) = mpsc::channel(16);
        let frames = Arc::new(AtomicU32::new(0));
        let receiver_task = spawn_receiver(&rx_side, out_rx, in_tx, Arc::clone(&frames));

        sender
            .run(
                &tx_side.manager,
                &out_tx,
                &mut in_rx,
                &cfg,
                &SignalOfStop::new(),
                |_, _| {},
            )
            .await
            .unwrap();

        let final_path = receiver_task.await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), data);
        // Only chunks 4..10 crossed the wire.
        assert_eq!(frames.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn zero_byte_file_sends_no_data_frames() {
        let tx_side = side();
        let rx_side = side();
        let cfg = test_config();
        let src = source_file(&tx_side._dir, b"").await;

        let sender = ChunkSender::prepare(
            &tx_side.manager,
            cfg.chunk_size,
            &src,
            "empty.txt".into(),
            "peer-receiver",
        )
        .await
        .unwrap();
        assert_eq!(sender.descriptor().total_chunks, 0);

        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, mut in_rx) = mpsc::channel(16);
        let frames = Arc::new(AtomicU32::new(0));
        let receiver_task = spawn_receiver(&rx_side, out_rx, in_tx, Arc::clone(&frames));

        sender
            .run(
                &tx_side.manager,
                &out_tx,
                &mut in_rx,
                &cfg,
                &SignalOfStop::new(),
                |_, _| {},
            )
            .await
            .unwrap();

        let final_path = receiver_task.await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap().len(), 0);
        assert_eq!(frames.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ack_starvation_raises_recoverable_transport_error() {
        let tx_side = side();
        let cfg = Config {
            ack_timeout: Duration::from_millis(50),
            max_retry: 1,
            ..test_config()
        };
        let data = vec![5u8; 3000];
        let src = source_file(&tx_side._dir, &data).await;

        let sender = ChunkSender::prepare(
            &tx_side.manager,
            cfg.chunk_size,
            &src,
            "source.bin".into(),
            "peer-receiver",
        )
        .await
        .unwrap();
        let hash = sender.descriptor().file_hash.clone();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (in_tx, mut in_rx) = mpsc::channel(16);
        // A peer that answers file_info but swallows every data frame.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Message::FileInfo(info) = msg {
                    in_tx
                        .send(Message::FileInfoAck(FileInfoAck {
                            file_hash: info.file_hash,
                        }))
                        .await
                        .ok();
                }
            }
        });

        let err = sender
            .run(
                &tx_side.manager,
                &out_tx,
                &mut in_rx,
                &cfg,
                &SignalOfStop::new(),
                |_, _| {},
            )
            .await
            .unwrap_err();
        assert!(err.is_recoverable(), "ack timeout must route to reconnect");

        // Progress survived for the resume.
        let pending = tx_side
            .manager
            .lock()
            .unwrap()
            .enumerate_pending("peer-receiver", Role::Sending);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].file_hash, hash);
    }

    #[tokio::test]
    async fn fully_complete_resume_jumps_to_file_complete() {
        let tx_side = side();
        let rx_side = side();
        let cfg = test_config();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 101) as u8).collect();
        let src = source_file(&tx_side._dir, &data).await;

        // The receiver holds every chunk already; only finalize is missing.
        let sender = ChunkSender::prepare(
            &tx_side.manager,
            cfg.chunk_size,
            &src,
            "source.bin".into(),
            "peer-receiver",
        )
        .await
        .unwrap();
        {
            let info = sender.file_info();
            let (mut rx, _) =
                ChunkReceiver::start(&rx_side.manager, &rx_side.download_dir, &info, "peer-sender")
                    .await
                    .unwrap();
            for (i, chunk) in data.chunks(1024).enumerate() {
                rx.on_data(&rx_side.manager, i as u32, chunk).await.unwrap();
            }
            rx.release(&rx_side.manager);
        }

        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, mut in_rx) = mpsc::channel(16);
        let frames = Arc::new(AtomicU32::new(0));
        let receiver_task = spawn_receiver(&rx_side, out_rx, in_tx, Arc::clone(&frames));

        sender
            .run(
                &tx_side.manager,
                &out_tx,
                &mut in_rx,
                &cfg,
                &SignalOfStop::new(),
                |_, _| {},
            )
            .await
            .unwrap();

        assert_eq!(frames.load(Ordering::SeqCst), 0, "no chunk crosses the wire");
        let final_path = receiver_task.await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn cancel_keeps_the_record() {
        let tx_side = side();
        let cfg = test_config();
        let data = vec![1u8; 5000];
        let src = source_file(&tx_side._dir, &data).await;

        let sender = ChunkSender::prepare(
            &tx_side.manager,
            cfg.chunk_size,
            &src,
            "source.bin".into(),
            "peer-receiver",
        )
        .await
        .unwrap();

        let cancel = SignalOfStop::new();
        cancel.cancel();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (in_tx, mut in_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Message::FileInfo(info) = msg {
                    in_tx
                        .send(Message::FileInfoAck(FileInfoAck {
                            file_hash: info.file_hash,
                        }))
                        .await
                        .ok();
                }
            }
        });

        let err = sender
            .run(&tx_side.manager, &out_tx, &mut in_rx, &cfg, &cancel, |_, _| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Cancelled));
        assert_eq!(
            tx_side
                .manager
                .lock()
                .unwrap()
                .enumerate_pending("peer-receiver", Role::Sending)
                .len(),
            1
        );
    }
}
