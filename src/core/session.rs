//! Session / pairing state machine.
//!
//! One worker per live TCP connection. Lifecycle:
//! `Init → Handshake → (Pairing | Trusted) → Active → Closing → Closed`,
//! with `Failed` reachable from any non-terminal state.
//!
//! Both sides exchange `HELLO` on connect. The accepting side then either
//! takes the trusted fast-path (`HELLO_ACK`) or generates a one-time
//! 6-digit pairing code and waits for the initiator's `PAIR_REQ`. Once
//! `Active`, the worker multiplexes transfer frames, heartbeats, and send
//! jobs; transfers on one session run strictly FIFO.
//!
//! The session owns the transport. Transfer workers never touch the socket:
//! the sender posts frames to the session's outbox and receives routed
//! frames back, so there is no bidirectional ownership between session and
//! transfer.

use crate::core::config::{
    Config, CLOSING_DRAIN, MAX_PAIR_FAILURES, PAIRING_WAIT, PAIR_CODE_LEN, PROTOCOL_VERSION,
};
use crate::core::error::{ErrorKind, ShareError};
use crate::core::identity::DeviceIdentity;
use crate::core::jobs::{JobHandle, JobState, SendJob};
use crate::core::node::NodeEvent;
use crate::core::protocol::{
    read_frame, write_frame, DecodeError, ErrorMsg, FileAck, FileCompleteAck, FileInfoAck,
    FileResume, Hello, HelloAck, Message, PairOk, PairReq,
};
use crate::core::transfer::manager::TransferStateManager;
use crate::core::transfer::receiver::ChunkReceiver;
use crate::core::transfer::sender::ChunkSender;
use crate::core::trust::TrustManager;
use crate::utils::sos::SignalOfStop;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Public surface ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshake,
    Pairing,
    Trusted,
    Active,
    Closing,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRole {
    Initiator,
    Acceptor,
}

/// Commands the node can post into a session.
pub enum SessionCommand {
    Send(SendJob),
    SubmitPairCode(String),
    Close,
}

/// Dependencies shared by every session worker, passed explicitly.
#[derive(Clone)]
pub struct SessionDeps {
    pub cfg: Config,
    pub identity: DeviceIdentity,
    pub trust: Arc<Mutex<TrustManager>>,
    pub manager: Arc<Mutex<TransferStateManager>>,
    pub events: mpsc::UnboundedSender<NodeEvent>,
    pub sos: SignalOfStop,
}

/// Mid-life notifications to the node.
#[derive(Debug)]
pub enum SessionNotice {
    /// HELLO exchanged: the peer's identity is known, though the session
    /// may still be pairing. Lets the node route `submit_pair_code`.
    PeerIdentified {
        session_id: Uuid,
        peer_device_id: String,
    },
    /// Handshake completed; the session is Active.
    Established {
        session_id: Uuid,
        peer_device_id: String,
        peer_hostname: String,
        peer_addr: SocketAddr,
    },
    /// The acceptor generated a pairing code for display.
    PairCode {
        session_id: Uuid,
        peer_device_id: String,
        code: String,
    },
    /// The worker exited. `error: None` is a graceful close; a recoverable
    /// error plus unfinished jobs is the reconnect supervisor's cue.
    Ended {
        session_id: Uuid,
        peer_device_id: Option<String>,
        error: Option<ShareError>,
        unfinished: Vec<SendJob>,
    },
}

/// Spawned per connection by the node.
pub async fn run_session(
    stream: TcpStream,
    role: ConnectRole,
    session_id: Uuid,
    deps: SessionDeps,
    mut cmds: mpsc::UnboundedReceiver<SessionCommand>,
    notices: mpsc::UnboundedSender<SessionNotice>,
) {
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = notices.send(SessionNotice::Ended {
                session_id,
                peer_device_id: None,
                error: Some(ShareError::transport(e)),
                unfinished: Vec::new(),
            });
            return;
        }
    };

    let mut session = Session {
        id: session_id,
        role,
        deps,
        notices: notices.clone(),
        peer_addr,
        peer: None,
        state: SessionState::Init,
        queue: VecDeque::new(),
        batch_remaining: HashMap::new(),
    };

    let (error, unfinished) = match session.drive(stream, &mut cmds).await {
        Ok(unfinished) => (None, unfinished),
        Err((err, unfinished)) => (Some(err), unfinished),
    };

    let peer_device_id = session.peer.as_ref().map(|p| p.device_id.clone());
    info!(
        event = "session_ended",
        session = %session_id,
        peer = peer_device_id.as_deref().unwrap_or("unknown"),
        state = ?session.state,
        error = %error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        "Session worker exited"
    );
    let _ = notices.send(SessionNotice::Ended {
        session_id,
        peer_device_id,
        error,
        unfinished,
    });
}

// ── Worker internals ─────────────────────────────────────────────────────────

enum ReaderItem {
    Frame(Message),
    Bad(DecodeError),
}

struct ActiveSend {
    job: SendJob,
    frames_tx: mpsc::Sender<Message>,
}

type DriveErr = (ShareError, Vec<SendJob>);

struct Session {
    id: Uuid,
    role: ConnectRole,
    deps: SessionDeps,
    notices: mpsc::UnboundedSender<SessionNotice>,
    peer_addr: SocketAddr,
    peer: Option<Hello>,
    state: SessionState,
    queue: VecDeque<SendJob>,
    /// Files still owed per job batch; a batch completes at zero.
    batch_remaining: HashMap<JobHandle, u32>,
}

impl Session {
    fn peer_id(&self) -> &str {
        self.peer.as_ref().map(|p| p.device_id.as_str()).unwrap_or("")
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.deps.events.send(event);
    }

    async fn drive(
        &mut self,
        stream: TcpStream,
        cmds: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<Vec<SendJob>, DriveErr> {
        let (mut reader, mut writer) = stream.into_split();

        self.state = SessionState::Handshake;
        let peer = self
            .exchange_hello(&mut reader, &mut writer)
            .await
            .map_err(|e| (e, Vec::new()))?;
        let _ = self.notices.send(SessionNotice::PeerIdentified {
            session_id: self.id,
            peer_device_id: peer.device_id.clone(),
        });
        self.peer = Some(peer);

        match self.role {
            ConnectRole::Acceptor => self.accept_auth(&mut reader, &mut writer).await,
            ConnectRole::Initiator => self.initiate_auth(&mut reader, &mut writer, cmds).await,
        }
        .map_err(|e| (e, self.drain_queue()))?;

        self.state = SessionState::Active;
        let peer = self.peer.clone().expect("peer set after handshake");
        info!(
            event = "session_active",
            session = %self.id,
            peer = %peer.device_id,
            addr = %self.peer_addr,
            "Session is active"
        );
        let _ = self.notices.send(SessionNotice::Established {
            session_id: self.id,
            peer_device_id: peer.device_id.clone(),
            peer_hostname: peer.hostname.clone(),
            peer_addr: self.peer_addr,
        });

        self.active(reader, writer, cmds).await
    }

    // ── Handshake ────────────────────────────────────────────────────────

    async fn exchange_hello(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Hello, ShareError> {
        let hello = Message::Hello(Hello {
            device_id: self.deps.identity.device_id.clone(),
            hostname: self.deps.identity.hostname.clone(),
            protocol_version: PROTOCOL_VERSION,
        });
        write_frame(writer, &hello)
            .await
            .map_err(ShareError::transport)?;

        let msg = self.read_with_timeout(reader, self.deps.cfg.connect_timeout).await?;
        match msg {
            Message::Hello(peer) => {
                if peer.protocol_version != PROTOCOL_VERSION {
                    let _ = write_frame(
                        writer,
                        &Message::Error(ErrorMsg {
                            kind: "version".into(),
                            detail: format!(
                                "protocol {} not supported (local {})",
                                peer.protocol_version, PROTOCOL_VERSION
                            ),
                        }),
                    )
                    .await;
                    return Err(ShareError::protocol(format!(
                        "peer speaks protocol {}, local {}",
                        peer.protocol_version, PROTOCOL_VERSION
                    )));
                }
                Ok(peer)
            }
            Message::Error(e) => Err(ShareError::protocol(format!("{}: {}", e.kind, e.detail))),
            other => Err(ShareError::protocol(format!(
                "expected hello, got {}",
                other.name()
            ))),
        }
    }

    /// Acceptor side: trusted fast-path or pairing-code exchange.
    async fn accept_auth(
        &mut self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), ShareError> {
        let peer = self.peer.clone().expect("hello exchanged");
        let trusted = self
            .deps
            .trust
            .lock()
            .expect("trust manager poisoned")
            .is_trusted(&peer.device_id);

        if trusted {
            self.state = SessionState::Trusted;
            write_frame(writer, &Message::HelloAck(self.hello_ack()))
                .await
                .map_err(ShareError::transport)?;
            self.touch_trust(&peer);
            return Ok(());
        }

        self.state = SessionState::Pairing;
        let code = pairing_code();
        info!(
            event = "pairing_started",
            session = %self.id,
            peer = %peer.device_id,
            "Generated pairing code for unknown peer"
        );
        let _ = self.notices.send(SessionNotice::PairCode {
            session_id: self.id,
            peer_device_id: peer.device_id.clone(),
            code: code.clone(),
        });
        self.emit(NodeEvent::PairRequest {
            peer_device_id: peer.device_id.clone(),
            peer_hostname: peer.hostname.clone(),
            code: Some(code.clone()),
        });

        let deadline = tokio::time::Instant::now() + PAIRING_WAIT;
        let mut failures = 0u32;
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            let msg = match timeout(remaining, self.read_one(reader)).await {
                Ok(msg) => msg?,
                Err(_) => return Err(ShareError::Pairing("pairing timed out".into())),
            };
            match msg {
                Message::PairReq(req) => {
                    if req.code == code {
                        write_frame(writer, &Message::PairOk(self.pair_ok()))
                            .await
                            .map_err(ShareError::transport)?;
                        self.add_trust(&peer);
                        return Ok(());
                    }
                    failures += 1;
                    warn!(
                        event = "pair_code_mismatch",
                        session = %self.id,
                        peer = %peer.device_id,
                        failures,
                        "Wrong pairing code"
                    );
                    if failures >= MAX_PAIR_FAILURES {
                        let _ = write_frame(
                            writer,
                            &Message::Error(ErrorMsg {
                                kind: "pairing_refused".into(),
                                detail: "too many wrong codes".into(),
                            }),
                        )
                        .await;
                        return Err(ShareError::Pairing("too many wrong codes".into()));
                    }
                    write_frame(
                        writer,
                        &Message::PairFail(crate::core::protocol::PairFail {
                            reason: "code mismatch".into(),
                        }),
                    )
                    .await
                    .map_err(ShareError::transport)?;
                }
                Message::Bye => return Err(ShareError::Cancelled),
                other => {
                    return Err(ShareError::protocol(format!(
                        "unexpected {} during pairing",
                        other.name()
                    )))
                }
            }
        }
    }

    /// Initiator side: wait for the acceptor's verdict, relaying the user's
    /// pairing code when it arrives.
    async fn initiate_auth(
        &mut self,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        cmds: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<(), ShareError> {
        let peer = self.peer.clone().expect("hello exchanged");
        let locally_trusted = self
            .deps
            .trust
            .lock()
            .expect("trust manager poisoned")
            .is_trusted(&peer.device_id);
        if !locally_trusted {
            self.state = SessionState::Pairing;
            // The embedder should prompt for the code shown on the peer.
            self.emit(NodeEvent::PairRequest {
                peer_device_id: peer.device_id.clone(),
                peer_hostname: peer.hostname.clone(),
                code: None,
            });
        }

        let deadline = tokio::time::Instant::now() + PAIRING_WAIT;
        let max_frame = self.deps.cfg.max_frame();
        let sos = self.deps.sos.clone();
        loop {
            let remaining = deadline - tokio::time::Instant::now();
            tokio::select! {
                msg = timeout(remaining, read_frame(reader, max_frame)) => {
                    let msg = match msg {
                        Ok(Ok(msg)) => msg,
                        Ok(Err(e)) => return Err(decode_to_share(e)),
                        Err(_) => return Err(ShareError::Pairing("pairing timed out".into())),
                    };
                    match msg {
                        Message::HelloAck(_) | Message::PairOk(_) => {
                            self.state = SessionState::Trusted;
                            if matches!(msg, Message::PairOk(_)) {
                                // Mirror the acceptor's PAIR_OK so both ends
                                // record the pairing.
                                let _ = write_frame(writer, &Message::PairOk(self.pair_ok())).await;
                            }
                            self.add_trust(&peer);
                            return Ok(());
                        }
                        Message::PairFail(fail) => {
                            warn!(
                                event = "pair_rejected",
                                session = %self.id,
                                reason = %fail.reason,
                                "Pairing code rejected, awaiting a new code"
                            );
                            self.emit(NodeEvent::PairRequest {
                                peer_device_id: peer.device_id.clone(),
                                peer_hostname: peer.hostname.clone(),
                                code: None,
                            });
                        }
                        Message::Error(e) if e.kind == "pairing_refused" => {
                            return Err(ShareError::Pairing(e.detail));
                        }
                        Message::Error(e) => {
                            return Err(ShareError::protocol(format!("{}: {}", e.kind, e.detail)));
                        }
                        other => {
                            return Err(ShareError::protocol(format!(
                                "unexpected {} during pairing",
                                other.name()
                            )))
                        }
                    }
                }
                cmd = cmds.recv() => {
                    match cmd {
                        Some(SessionCommand::SubmitPairCode(code)) => {
                            write_frame(
                                writer,
                                &Message::PairReq(PairReq {
                                    device_id: self.deps.identity.device_id.clone(),
                                    hostname: self.deps.identity.hostname.clone(),
                                    code,
                                }),
                            )
                            .await
                            .map_err(ShareError::transport)?;
                        }
                        // Jobs queued before the session is Active wait here.
                        Some(SessionCommand::Send(job)) => self.enqueue(job),
                        Some(SessionCommand::Close) | None => {
                            let _ = write_frame(writer, &Message::Bye).await;
                            return Err(ShareError::Cancelled);
                        }
                    }
                }
                _ = sos.wait() => {
                    let _ = write_frame(writer, &Message::Bye).await;
                    return Err(ShareError::Cancelled);
                }
            }
        }
    }

    // ── Active ───────────────────────────────────────────────────────────

    async fn active(
        &mut self,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        cmds: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Result<Vec<SendJob>, DriveErr> {
        let max_frame = self.deps.cfg.max_frame();

        // Writer task: drains the outbox. Transfer workers and this loop
        // share the sending side.
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(32);
        let mut writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(msg) = outbox_rx.recv().await {
                if write_frame(&mut writer, &msg).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: one frame at a time into the session loop.
        let (frame_tx, mut frame_rx) = mpsc::channel::<ReaderItem>(32);
        let mut reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match read_frame(&mut reader, max_frame).await {
                    Ok(msg) => {
                        if frame_tx.send(ReaderItem::Frame(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = frame_tx.send(ReaderItem::Bad(e)).await;
                        break;
                    }
                }
            }
        });

        let (done_tx, mut done_rx) = mpsc::channel::<(SendJob, Result<(), ShareError>)>(4);
        let mut active_send: Option<ActiveSend> = None;
        let mut receiver: Option<ChunkReceiver> = None;
        let mut heartbeat = tokio::time::interval(self.deps.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();
        let sos = self.deps.sos.clone();

        let result: Result<Vec<SendJob>, DriveErr> = loop {
            if active_send.is_none() {
                active_send = self.start_next_send(&outbox_tx, &done_tx);
            }

            tokio::select! {
                item = frame_rx.recv() => {
                    let item = match item {
                        Some(item) => item,
                        None => break Err(self.fail(ShareError::Transport("connection lost".into()), &mut active_send)),
                    };
                    match item {
                        ReaderItem::Frame(msg) => {
                            last_frame = Instant::now();
                            match self.on_frame(msg, &outbox_tx, &mut receiver, &mut active_send).await {
                                Ok(FrameVerdict::Continue) => {}
                                Ok(FrameVerdict::PeerClosed) => {
                                    self.state = SessionState::Closing;
                                    self.flush();
                                    self.stall_remaining(&mut active_send);
                                    break Ok(self.drain_queue());
                                }
                                Err(e) => break Err(self.fail(e, &mut active_send)),
                            }
                        }
                        ReaderItem::Bad(DecodeError::Malformed(detail)) => {
                            warn!(event = "protocol_violation", session = %self.id, detail = %detail, "Malformed frame");
                            let _ = outbox_tx.send(Message::Error(ErrorMsg {
                                kind: "protocol".into(),
                                detail,
                            })).await;
                            // Give the writer a moment to push the error out.
                            tokio::time::sleep(CLOSING_DRAIN / 10).await;
                            break Err(self.fail(ShareError::protocol("malformed frame from peer"), &mut active_send));
                        }
                        ReaderItem::Bad(e) => {
                            break Err(self.fail(ShareError::transport(e), &mut active_send));
                        }
                    }
                }
                Some((job, result)) = done_rx.recv() => {
                    active_send = None;
                    if let Err(e) = self.on_send_done(job, result) {
                        break Err(e);
                    }
                }
                _ = heartbeat.tick() => {
                    if last_frame.elapsed() > self.deps.cfg.heartbeat_timeout {
                        warn!(
                            event = "heartbeat_timeout",
                            session = %self.id,
                            peer = %self.peer_id(),
                            silent_for = ?last_frame.elapsed(),
                            "No frames within the heartbeat timeout"
                        );
                        break Err(self.fail(ShareError::Transport("heartbeat timeout".into()), &mut active_send));
                    }
                    let _ = outbox_tx.send(Message::Heartbeat).await;
                }
                cmd = cmds.recv() => {
                    match cmd {
                        Some(SessionCommand::Send(job)) => self.enqueue(job),
                        Some(SessionCommand::SubmitPairCode(_)) => {
                            debug!(event = "late_pair_code", session = %self.id, "Pair code after pairing finished, ignored");
                        }
                        Some(SessionCommand::Close) | None => {
                            self.state = SessionState::Closing;
                            let _ = outbox_tx.send(Message::Bye).await;
                            self.flush();
                            // Bounded drain so in-flight ACKs can land.
                            let _ = timeout(CLOSING_DRAIN, async {
                                while let Some((job, result)) = done_rx.recv().await {
                                    let _ = self.on_send_done(job, result);
                                }
                            }).await;
                            self.stall_remaining(&mut active_send);
                            break Ok(self.drain_queue());
                        }
                    }
                }
                _ = sos.wait() => {
                    self.state = SessionState::Closing;
                    let _ = outbox_tx.send(Message::Bye).await;
                    self.flush();
                    self.stall_remaining(&mut active_send);
                    break Ok(self.drain_queue());
                }
            }
        };

        if let Some(rx) = receiver.take() {
            rx.release(&self.deps.manager);
        }
        reader_task.abort();
        writer_task.abort();
        let _ = tokio::join!(&mut reader_task, &mut writer_task);

        self.state = match &result {
            Ok(_) => SessionState::Closed,
            Err(_) => SessionState::Failed,
        };
        result
    }

    /// Dispatch one inbound frame while Active.
    async fn on_frame(
        &mut self,
        msg: Message,
        outbox: &mpsc::Sender<Message>,
        receiver: &mut Option<ChunkReceiver>,
        active_send: &mut Option<ActiveSend>,
    ) -> Result<FrameVerdict, ShareError> {
        match msg {
            Message::Heartbeat => Ok(FrameVerdict::Continue),
            Message::Bye => Ok(FrameVerdict::PeerClosed),
            // Stray tail of the pairing exchange.
            Message::PairOk(_) => Ok(FrameVerdict::Continue),
            Message::FileResumeOk(_) => Ok(FrameVerdict::Continue),

            Message::FileInfo(info) => {
                if let Some(old) = receiver.take() {
                    debug!(
                        event = "receiver_superseded",
                        old = %old.file_hash(),
                        new = %info.file_hash,
                        "New file_info supersedes the previous transfer"
                    );
                    old.release(&self.deps.manager);
                }
                let peer_id = self.peer_id().to_string();
                match ChunkReceiver::start(
                    &self.deps.manager,
                    &self.deps.cfg.download_dir,
                    &info,
                    &peer_id,
                )
                .await
                {
                    Ok((rx, runs)) => {
                        self.emit(NodeEvent::TransferStarted {
                            job: None,
                            peer_device_id: peer_id,
                            file_name: info.file_name.clone(),
                        });
                        // The resume set goes out ahead of the ack so the
                        // sender adopts it before deciding its first chunk.
                        if !runs.is_empty() {
                            let _ = outbox
                                .send(Message::FileResume(FileResume {
                                    file_hash: info.file_hash.clone(),
                                    runs,
                                }))
                                .await;
                        }
                        let _ = outbox
                            .send(Message::FileInfoAck(FileInfoAck {
                                file_hash: info.file_hash.clone(),
                            }))
                            .await;
                        *receiver = Some(rx);
                        Ok(FrameVerdict::Continue)
                    }
                    Err(e @ ShareError::Protocol(_)) => Err(e),
                    Err(e) => {
                        let _ = outbox
                            .send(Message::Error(ErrorMsg {
                                kind: "state".into(),
                                detail: e.to_string(),
                            }))
                            .await;
                        Ok(FrameVerdict::Continue)
                    }
                }
            }

            Message::FileData { index, data } => {
                let Some(rx) = receiver.as_mut() else {
                    return Err(ShareError::protocol("file_data without file_info"));
                };
                match rx.on_data(&self.deps.manager, index, &data).await {
                    // Written or duplicate: both are acknowledged so the
                    // sender's bookkeeping converges.
                    Ok(_) => {
                        let _ = outbox
                            .send(Message::FileAck(FileAck {
                                file_hash: rx.file_hash().to_string(),
                                chunk_index: index,
                            }))
                            .await;
                        Ok(FrameVerdict::Continue)
                    }
                    Err(e @ ShareError::Protocol(_)) => Err(e),
                    Err(e) => {
                        // Disk trouble: this transfer fails, the session and
                        // its record survive.
                        warn!(event = "receive_write_failure", error = %e, "Chunk write failed");
                        let _ = outbox
                            .send(Message::Error(ErrorMsg {
                                kind: "state".into(),
                                detail: e.to_string(),
                            }))
                            .await;
                        let file_name = rx.descriptor().file_name.clone();
                        receiver.take().expect("receiver present").release(&self.deps.manager);
                        self.emit(NodeEvent::TransferFailed {
                            job: None,
                            peer_device_id: self.peer_id().to_string(),
                            file_name,
                            kind: ErrorKind::State,
                            detail: e.to_string(),
                        });
                        Ok(FrameVerdict::Continue)
                    }
                }
            }

            Message::FileComplete(complete) => {
                let Some(rx) = receiver.take() else {
                    return Err(ShareError::protocol("file_complete without file_info"));
                };
                if rx.file_hash() != complete.file_hash {
                    return Err(ShareError::protocol("file_complete for a different transfer"));
                }
                let file_name = rx.descriptor().file_name.clone();
                let peer_id = self.peer_id().to_string();
                match rx.finalize(&self.deps.manager).await {
                    Ok(path) => {
                        let _ = outbox
                            .send(Message::FileCompleteAck(FileCompleteAck {
                                file_hash: complete.file_hash,
                            }))
                            .await;
                        self.emit(NodeEvent::TransferComplete {
                            job: None,
                            peer_device_id: peer_id,
                            file_name,
                            path: Some(path),
                        });
                        Ok(FrameVerdict::Continue)
                    }
                    Err(e @ ShareError::Integrity(_)) => {
                        let _ = outbox
                            .send(Message::Error(ErrorMsg {
                                kind: "integrity".into(),
                                detail: "content hash mismatch".into(),
                            }))
                            .await;
                        self.emit(NodeEvent::TransferFailed {
                            job: None,
                            peer_device_id: peer_id,
                            file_name,
                            kind: ErrorKind::Integrity,
                            detail: e.to_string(),
                        });
                        Ok(FrameVerdict::Continue)
                    }
                    Err(e) => Err(e),
                }
            }

            // Sender-bound frames are routed to the active transfer worker.
            msg @ (Message::FileInfoAck(_)
            | Message::FileResume(_)
            | Message::FileAck(_)
            | Message::FileAckBatch(_)
            | Message::FileCompleteAck(_)) => {
                if let Some(send) = active_send {
                    let _ = send.frames_tx.send(msg).await;
                } else {
                    debug!(event = "orphan_ack", frame = msg.name(), "Transfer frame with no active send");
                }
                Ok(FrameVerdict::Continue)
            }

            Message::Error(err) => {
                // Transfer-scoped failures go to the sender worker; anything
                // else is a session-fatal protocol condition.
                if err.kind == "integrity" || err.kind == "state" {
                    if let Some(send) = active_send {
                        let _ = send.frames_tx.send(Message::Error(err)).await;
                    } else {
                        warn!(event = "peer_error", kind = %err.kind, detail = %err.detail, "Peer reported an error");
                    }
                    Ok(FrameVerdict::Continue)
                } else {
                    Err(ShareError::protocol(format!("{}: {}", err.kind, err.detail)))
                }
            }

            other @ (Message::Hello(_)
            | Message::HelloAck(_)
            | Message::PairReq(_)
            | Message::PairFail(_)) => Err(ShareError::protocol(format!(
                "unexpected {} while active",
                other.name()
            ))),
        }
    }

    /// Pop the next non-cancelled job and spawn its sender worker.
    fn start_next_send(
        &mut self,
        outbox: &mpsc::Sender<Message>,
        done_tx: &mpsc::Sender<(SendJob, Result<(), ShareError>)>,
    ) -> Option<ActiveSend> {
        let job = loop {
            let job = self.queue.pop_front()?;
            if job.cancel.cancelled() {
                job.shared.set_state(JobState::Cancelled);
                self.forget_batch_file(&job);
                continue;
            }
            break job;
        };

        let (frames_tx, mut frames_rx) = mpsc::channel::<Message>(32);
        let manager = Arc::clone(&self.deps.manager);
        let outbox = outbox.clone();
        let done = done_tx.clone();
        let cfg = self.deps.cfg.clone();
        let events = self.deps.events.clone();
        let peer_id = self.peer_id().to_string();
        let task_job = job.clone();

        tokio::spawn(async move {
            debug!(
                event = "file_send_starting",
                file = %task_job.file_name,
                size = task_job.size,
                "Hashing source and opening the sending record"
            );
            let result = async {
                let sender = ChunkSender::prepare(
                    &manager,
                    cfg.chunk_size,
                    &task_job.path,
                    task_job.file_name.clone(),
                    &peer_id,
                )
                .await?;

                task_job.shared.set_state(JobState::Active);
                let _ = events.send(NodeEvent::TransferStarted {
                    job: Some(task_job.job_id),
                    peer_device_id: peer_id.clone(),
                    file_name: task_job.file_name.clone(),
                });

                let base = task_job.shared.bytes_done.load(Ordering::Relaxed);
                let shared = Arc::clone(&task_job.shared);
                let progress_events = events.clone();
                let job_id = task_job.job_id;
                let peer_for_events = peer_id.clone();
                let file_name = task_job.file_name.clone();
                sender
                    .run(
                        &manager,
                        &outbox,
                        &mut frames_rx,
                        &cfg,
                        &task_job.cancel,
                        move |done_bytes, _total| {
                            shared.bytes_done.store(base + done_bytes, Ordering::Relaxed);
                            let _ = progress_events.send(NodeEvent::TransferProgress {
                                job: Some(job_id),
                                peer_device_id: peer_for_events.clone(),
                                file_name: file_name.clone(),
                                bytes_done: shared.bytes_done.load(Ordering::Relaxed),
                                bytes_total: shared.bytes_total.load(Ordering::Relaxed),
                            });
                        },
                    )
                    .await
            }
            .await;
            let _ = done.send((task_job, result)).await;
        });

        Some(ActiveSend { job, frames_tx })
    }

    /// Bookkeeping after a sender worker finishes one file.
    fn on_send_done(
        &mut self,
        job: SendJob,
        result: Result<(), ShareError>,
    ) -> Result<(), DriveErr> {
        match result {
            Ok(()) => {
                if self.forget_batch_file(&job) {
                    job.shared.set_state(JobState::Complete);
                    self.emit(NodeEvent::TransferComplete {
                        job: Some(job.job_id),
                        peer_device_id: self.peer_id().to_string(),
                        file_name: job.file_name.clone(),
                        path: None,
                    });
                }
                Ok(())
            }
            Err(ShareError::Cancelled) => {
                job.shared.set_state(JobState::Cancelled);
                self.drop_batch(job.job_id);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                // Put the file back at the head so the resumed session
                // retries it first, then fail the session.
                self.queue.push_front(job);
                Err(self.fail_now(e))
            }
            Err(e) => {
                job.shared.set_state(JobState::Failed(e.kind()));
                self.emit(NodeEvent::TransferFailed {
                    job: Some(job.job_id),
                    peer_device_id: self.peer_id().to_string(),
                    file_name: job.file_name.clone(),
                    kind: e.kind(),
                    detail: e.to_string(),
                });
                self.drop_batch(job.job_id);
                match e {
                    // A protocol-shaped failure poisons the whole session.
                    ShareError::Protocol(_) => Err(self.fail_now(e)),
                    _ => Ok(()),
                }
            }
        }
    }

    fn enqueue(&mut self, job: SendJob) {
        *self.batch_remaining.entry(job.job_id).or_insert(0) += 1;
        self.queue.push_back(job);
    }

    /// Returns true when this was the batch's last outstanding file.
    fn forget_batch_file(&mut self, job: &SendJob) -> bool {
        match self.batch_remaining.get_mut(&job.job_id) {
            Some(n) => {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    self.batch_remaining.remove(&job.job_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    /// Remove every queued file of a batch (after a terminal failure).
    fn drop_batch(&mut self, job_id: JobHandle) {
        self.queue.retain(|j| j.job_id != job_id);
        self.batch_remaining.remove(&job_id);
    }

    fn fail(&mut self, err: ShareError, active_send: &mut Option<ActiveSend>) -> DriveErr {
        if let Some(send) = active_send.take() {
            self.queue.push_front(send.job);
        }
        self.fail_now(err)
    }

    fn fail_now(&mut self, err: ShareError) -> DriveErr {
        self.state = SessionState::Failed;
        self.flush();
        (err, self.drain_queue())
    }

    fn drain_queue(&mut self) -> Vec<SendJob> {
        self.batch_remaining.clear();
        self.queue.drain(..).collect()
    }

    /// Mark whatever cannot continue on a graceful close as stalled; the
    /// records stay on disk for a manual retry.
    fn stall_remaining(&mut self, active_send: &mut Option<ActiveSend>) {
        if let Some(send) = active_send.take() {
            send.job.shared.set_state(JobState::Stalled);
            self.queue.push_front(send.job);
        }
        for job in &self.queue {
            job.shared.set_state(JobState::Stalled);
        }
    }

    fn flush(&self) {
        self.deps
            .manager
            .lock()
            .expect("transfer manager poisoned")
            .flush_all();
    }

    async fn read_one(&self, reader: &mut OwnedReadHalf) -> Result<Message, ShareError> {
        read_frame(reader, self.deps.cfg.max_frame())
            .await
            .map_err(decode_to_share)
    }

    async fn read_with_timeout(
        &self,
        reader: &mut OwnedReadHalf,
        wait: std::time::Duration,
    ) -> Result<Message, ShareError> {
        timeout(wait, self.read_one(reader))
            .await
            .map_err(|_| ShareError::Transport("read timeout".into()))?
    }

    fn hello_ack(&self) -> HelloAck {
        HelloAck {
            device_id: self.deps.identity.device_id.clone(),
            hostname: self.deps.identity.hostname.clone(),
        }
    }

    fn pair_ok(&self) -> PairOk {
        PairOk {
            device_id: self.deps.identity.device_id.clone(),
            hostname: self.deps.identity.hostname.clone(),
        }
    }

    fn add_trust(&self, peer: &Hello) {
        let _ = self
            .deps
            .trust
            .lock()
            .expect("trust manager poisoned")
            .trust(&peer.device_id, &peer.hostname, &self.peer_addr.ip().to_string());
    }

    fn touch_trust(&self, peer: &Hello) {
        let _ = self
            .deps
            .trust
            .lock()
            .expect("trust manager poisoned")
            .touch(&peer.device_id, &self.peer_addr.ip().to_string());
    }
}

enum FrameVerdict {
    Continue,
    PeerClosed,
}

fn decode_to_share(e: DecodeError) -> ShareError {
    match e {
        DecodeError::Malformed(detail) => ShareError::Protocol(detail),
        other => ShareError::transport(other),
    }
}

/// A uniform-random 6-digit code, leading zeros allowed.
fn pairing_code() -> String {
    let n: u32 = rand::rng().random_range(0..10u32.pow(PAIR_CODE_LEN as u32));
    format!("{n:0width$}", width = PAIR_CODE_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs;
    use crate::core::store::StateStore;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Peer {
        deps: SessionDeps,
        events: mpsc::UnboundedReceiver<NodeEvent>,
        download_dir: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn peer(tag: &str) -> Peer {
        let dir = tempfile::tempdir().unwrap();
        let download_dir = dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();
        let store = StateStore::open(download_dir.join(".lan_share")).unwrap();
        let identity = DeviceIdentity::load_or_create(&store).unwrap();
        let trust = Arc::new(Mutex::new(TrustManager::load(store.clone()).unwrap()));
        let manager = Arc::new(Mutex::new(TransferStateManager::new(
            store,
            50,
            Duration::from_secs(3600),
        )));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cfg = Config {
            chunk_size: 1024,
            ack_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            download_dir: download_dir.clone(),
            ..Config::default()
        };
        Peer {
            deps: SessionDeps {
                cfg,
                identity,
                trust,
                manager,
                events: events_tx,
                sos: SignalOfStop::new(),
            },
            events: events_rx,
            download_dir,
            _dir: dir,
        }
    }

    struct Spawned {
        cmds: mpsc::UnboundedSender<SessionCommand>,
        notices: mpsc::UnboundedReceiver<SessionNotice>,
    }

    fn spawn_side(stream: TcpStream, role: ConnectRole, deps: &SessionDeps) -> Spawned {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_session(
            stream,
            role,
            Uuid::new_v4(),
            deps.clone(),
            cmd_rx,
            notice_tx,
        ));
        Spawned {
            cmds: cmd_tx,
            notices: notice_rx,
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dialed.unwrap(), accepted.unwrap().0)
    }

    async fn wait_established(side: &mut Spawned) -> String {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), side.notices.recv())
                .await
                .expect("notice timeout")
                .expect("notices closed");
            match notice {
                SessionNotice::Established { peer_device_id, .. } => return peer_device_id,
                SessionNotice::Ended { error, .. } => panic!("session ended early: {error:?}"),
                _ => continue,
            }
        }
    }

    async fn wait_pair_code(side: &mut Spawned) -> String {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), side.notices.recv())
                .await
                .expect("notice timeout")
                .expect("notices closed");
            if let SessionNotice::PairCode { code, .. } = notice {
                return code;
            }
        }
    }

    async fn wait_ended(side: &mut Spawned) -> Option<ShareError> {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), side.notices.recv())
                .await
                .expect("notice timeout")
                .expect("notices closed");
            if let SessionNotice::Ended { error, .. } = notice {
                return error;
            }
        }
    }

    #[tokio::test]
    async fn pair_then_transfer() {
        let mut a = peer("alice");
        let b = peer("bob");
        let (dialed, accepted) = connected_pair().await;

        let mut side_a = spawn_side(dialed, ConnectRole::Initiator, &a.deps);
        let mut side_b = spawn_side(accepted, ConnectRole::Acceptor, &b.deps);

        // B displays the code out-of-band; A submits it.
        let code = wait_pair_code(&mut side_b).await;
        assert_eq!(code.len(), PAIR_CODE_LEN);
        side_a
            .cmds
            .send(SessionCommand::SubmitPairCode(code))
            .unwrap();

        let b_seen_by_a = wait_established(&mut side_a).await;
        let a_seen_by_b = wait_established(&mut side_b).await;
        assert_eq!(b_seen_by_a, b.deps.identity.device_id);
        assert_eq!(a_seen_by_b, a.deps.identity.device_id);

        // Pairing landed both peers in both trusted sets.
        assert!(a.deps.trust.lock().unwrap().is_trusted(&b.deps.identity.device_id));
        assert!(b.deps.trust.lock().unwrap().is_trusted(&a.deps.identity.device_id));

        // A sends a 200-byte file.
        let src = a._dir.path().join("hello.txt");
        let body: Vec<u8> = (0..200u8).collect();
        std::fs::write(&src, &body).unwrap();
        let (jobs, shared) = jobs::expand(&src, Uuid::new_v4()).unwrap();
        for job in jobs {
            side_a.cmds.send(SessionCommand::Send(job)).unwrap();
        }

        // Wait for A's completion event.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let ev = tokio::time::timeout_at(deadline, a.events.recv())
                .await
                .expect("event timeout")
                .expect("events closed");
            if matches!(ev, NodeEvent::TransferComplete { .. }) {
                break;
            }
        }
        assert_eq!(shared.snapshot().state, JobState::Complete);
        assert_eq!(shared.snapshot().bytes_done, 200);

        // The file landed at B, byte for byte.
        let received = b.download_dir.join("hello.txt");
        assert_eq!(std::fs::read(&received).unwrap(), body);

        // Both records are gone after completion.
        assert!(a
            .deps
            .manager
            .lock()
            .unwrap()
            .enumerate_pending(&b.deps.identity.device_id, crate::core::transfer::record::Role::Sending)
            .is_empty());
        assert!(b
            .deps
            .manager
            .lock()
            .unwrap()
            .enumerate_pending(&a.deps.identity.device_id, crate::core::transfer::record::Role::Receiving)
            .is_empty());

        side_a.cmds.send(SessionCommand::Close).unwrap();
        assert!(wait_ended(&mut side_a).await.is_none());
    }

    #[tokio::test]
    async fn three_wrong_codes_refuse_pairing() {
        let a = peer("alice");
        let b = peer("bob");
        let (dialed, accepted) = connected_pair().await;

        let mut side_a = spawn_side(dialed, ConnectRole::Initiator, &a.deps);
        let mut side_b = spawn_side(accepted, ConnectRole::Acceptor, &b.deps);

        let code = wait_pair_code(&mut side_b).await;
        let wrong = if code == "000000" { "000001" } else { "000000" };
        for _ in 0..3 {
            side_a
                .cmds
                .send(SessionCommand::SubmitPairCode(wrong.to_string()))
                .unwrap();
        }

        let err_b = wait_ended(&mut side_b).await.expect("acceptor must fail");
        assert_eq!(err_b.kind(), ErrorKind::Pairing);
        let err_a = wait_ended(&mut side_a).await.expect("initiator must fail");
        assert_eq!(err_a.kind(), ErrorKind::Pairing);

        // Nobody got trusted.
        assert!(!b.deps.trust.lock().unwrap().is_trusted(&a.deps.identity.device_id));
        assert!(!a.deps.trust.lock().unwrap().is_trusted(&b.deps.identity.device_id));
    }

    #[tokio::test]
    async fn trusted_peers_skip_pairing() {
        let mut a = peer("alice");
        let mut b = peer("bob");
        a.deps
            .trust
            .lock()
            .unwrap()
            .trust(&b.deps.identity.device_id, "bob-host", "127.0.0.1")
            .unwrap();
        b.deps
            .trust
            .lock()
            .unwrap()
            .trust(&a.deps.identity.device_id, "alice-host", "10.0.0.9")
            .unwrap();

        let (dialed, accepted) = connected_pair().await;
        let mut side_a = spawn_side(dialed, ConnectRole::Initiator, &a.deps);
        let mut side_b = spawn_side(accepted, ConnectRole::Acceptor, &b.deps);

        wait_established(&mut side_a).await;
        wait_established(&mut side_b).await;

        // No pairing event fired anywhere.
        assert!(a.events.try_recv().is_err());
        assert!(b.events.try_recv().is_err());

        // The acceptor refreshed the initiator's last known IP.
        let ip = b
            .deps
            .trust
            .lock()
            .unwrap()
            .get(&a.deps.identity.device_id)
            .unwrap()
            .last_known_ip
            .clone();
        assert_eq!(ip, "127.0.0.1");
    }

    /// A raw peer speaking garbage mid-session: the session answers with a
    /// protocol error and fails without reconnect, record intact.
    #[tokio::test]
    async fn corrupt_frame_fails_the_session_without_reconnect() {
        let b = peer("bob");
        let raw_id = "host-raw-0000";
        b.deps
            .trust
            .lock()
            .unwrap()
            .trust(raw_id, "raw", "127.0.0.1")
            .unwrap();

        let (mut raw, accepted) = connected_pair().await;
        let mut side_b = spawn_side(accepted, ConnectRole::Acceptor, &b.deps);

        // Trusted handshake by hand.
        write_frame(
            &mut raw,
            &Message::Hello(Hello {
                device_id: raw_id.into(),
                hostname: "raw".into(),
                protocol_version: PROTOCOL_VERSION,
            }),
        )
        .await
        .unwrap();
        let max = b.deps.cfg.max_frame();
        assert!(matches!(read_frame(&mut raw, max).await.unwrap(), Message::Hello(_)));
        assert!(matches!(read_frame(&mut raw, max).await.unwrap(), Message::HelloAck(_)));

        // Inject a frame with an unknown type byte.
        use tokio::io::AsyncWriteExt;
        raw.write_all(&[0, 0, 0, 1, 0xFF]).await.unwrap();

        // The peer answers ERROR(protocol) before dropping the session.
        let answer = loop {
            match read_frame(&mut raw, max).await.unwrap() {
                Message::Heartbeat => continue,
                other => break other,
            }
        };
        match answer {
            Message::Error(e) => assert_eq!(e.kind, "protocol"),
            other => panic!("expected protocol error, got {}", other.name()),
        }

        let err = wait_ended(&mut side_b).await.expect("session must fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.is_recoverable(), "protocol failures never reconnect");
    }

    #[tokio::test]
    async fn version_mismatch_is_fatal() {
        let b = peer("bob");
        let (mut raw, accepted) = connected_pair().await;
        let mut side_b = spawn_side(accepted, ConnectRole::Acceptor, &b.deps);

        write_frame(
            &mut raw,
            &Message::Hello(Hello {
                device_id: "host-old-1".into(),
                hostname: "old".into(),
                protocol_version: 99,
            }),
        )
        .await
        .unwrap();

        let max = b.deps.cfg.max_frame();
        // Our own hello first, then the version error.
        assert!(matches!(read_frame(&mut raw, max).await.unwrap(), Message::Hello(_)));
        match read_frame(&mut raw, max).await.unwrap() {
            Message::Error(e) => assert_eq!(e.kind, "version"),
            other => panic!("expected version error, got {}", other.name()),
        }

        let err = wait_ended(&mut side_b).await.expect("session must fail");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn pairing_codes_are_six_digits() {
        for _ in 0..100 {
            let code = pairing_code();
            assert_eq!(code.len(), PAIR_CODE_LEN);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
