//! Node: wires every worker together and exposes the embedder-facing API.
//!
//! One discovery worker, one TCP listener, one worker per live session, one
//! reconnect supervisor per failed peer. Everything communicates through
//! channels into the node's event loop; the loop owns the session table and
//! the job table, so no worker ever mutates another worker's state.

use crate::core::config::Config;
use crate::core::discovery::{DiscoveredPeer, Discovery, DiscoveryEvent};
use crate::core::error::ErrorKind;
use crate::core::identity::DeviceIdentity;
use crate::core::jobs::{self, JobHandle, JobProgress, JobState, SendJob};
use crate::core::reconnect::{run_reconnect, ReconnectPlan};
use crate::core::session::{
    run_session, ConnectRole, SessionCommand, SessionDeps, SessionNotice,
};
use crate::core::store::StateStore;
use crate::core::transfer::manager::TransferStateManager;
use crate::core::trust::TrustManager;
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Events ───────────────────────────────────────────────────────────────────

/// Structured events delivered to the embedder.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerDiscovered(DiscoveredPeer),
    PeerLost {
        device_id: String,
    },
    /// On the accepting side `code` carries the digits to display; on the
    /// initiating side it is `None` and the embedder should prompt.
    PairRequest {
        peer_device_id: String,
        peer_hostname: String,
        code: Option<String>,
    },
    TransferStarted {
        job: Option<JobHandle>,
        peer_device_id: String,
        file_name: String,
    },
    TransferProgress {
        job: Option<JobHandle>,
        peer_device_id: String,
        file_name: String,
        bytes_done: u64,
        bytes_total: u64,
    },
    TransferComplete {
        job: Option<JobHandle>,
        peer_device_id: String,
        file_name: String,
        /// Where the file landed (receiving side only).
        path: Option<PathBuf>,
    },
    TransferFailed {
        job: Option<JobHandle>,
        peer_device_id: String,
        file_name: String,
        kind: ErrorKind,
        detail: String,
    },
    Reconnecting {
        peer_device_id: String,
    },
    Reconnected {
        peer_device_id: String,
    },
}

// ── API plumbing ─────────────────────────────────────────────────────────────

enum ApiCmd {
    Send {
        path: PathBuf,
        peer_device_id: String,
        reply: oneshot::Sender<Result<JobHandle>>,
    },
    Connect {
        addr: SocketAddr,
    },
    SubmitPairCode {
        peer_device_id: String,
        code: String,
    },
}

enum Internal {
    NewSession {
        session_id: Uuid,
        role: ConnectRole,
        cmd_tx: mpsc::UnboundedSender<SessionCommand>,
        dialed_addr: Option<SocketAddr>,
    },
    Notice(SessionNotice),
    Discovery(DiscoveryEvent),
    Api(ApiCmd),
    ReconnectDone {
        peer_device_id: String,
        stream: Option<TcpStream>,
        jobs: Vec<SendJob>,
    },
}

struct JobEntry {
    shared: Arc<jobs::JobShared>,
    cancel: SignalOfStop,
}

struct SessionEntry {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    role: ConnectRole,
    peer: Option<String>,
    dialed_addr: Option<SocketAddr>,
    established_addr: Option<SocketAddr>,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// The embedder's view of a running node. Cloneable where it matters; the
/// event stream can be taken exactly once.
pub struct NodeHandle {
    device_id: String,
    tcp_addr: SocketAddr,
    api_tx: mpsc::UnboundedSender<Internal>,
    discovery: Discovery,
    trust: Arc<Mutex<TrustManager>>,
    jobs: Arc<Mutex<HashMap<JobHandle, JobEntry>>>,
    pair_codes: Arc<Mutex<HashMap<String, String>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
    sos: SignalOfStop,
}

impl NodeHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The address the session listener actually bound.
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Peers currently visible via discovery.
    pub fn list_peers(&self) -> Vec<DiscoveredPeer> {
        self.discovery.peers()
    }

    /// Submit a send job. A directory expands into one file job per
    /// contained file under a single handle with aggregated progress.
    pub async fn send(&self, path: impl Into<PathBuf>, peer_device_id: &str) -> Result<JobHandle> {
        let (reply, rx) = oneshot::channel();
        self.api_tx
            .send(Internal::Api(ApiCmd::Send {
                path: path.into(),
                peer_device_id: peer_device_id.to_string(),
                reply,
            }))
            .map_err(|_| anyhow!("node is shut down"))?;
        rx.await.map_err(|_| anyhow!("node is shut down"))?
    }

    /// Dial a peer by address (no discovery involved). Pairing or the
    /// trusted fast-path proceeds as usual once connected.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.api_tx
            .send(Internal::Api(ApiCmd::Connect { addr }))
            .map_err(|_| anyhow!("node is shut down"))
    }

    /// Cancel a job batch. Progress records stay on disk; the transfer can
    /// be resumed by a later send of the same content.
    pub fn cancel(&self, job: JobHandle) {
        if let Some(entry) = self.jobs.lock().expect("job table poisoned").get(&job) {
            entry.cancel.cancel();
            if entry.shared.state() == JobState::Queued {
                entry.shared.set_state(JobState::Cancelled);
            }
        }
    }

    pub fn progress(&self, job: JobHandle) -> Option<JobProgress> {
        self.jobs
            .lock()
            .expect("job table poisoned")
            .get(&job)
            .map(|e| e.shared.snapshot())
    }

    /// Pairing codes currently displayed for unpaired inbound peers.
    pub fn pending_pair_codes(&self) -> Vec<(String, String)> {
        self.pair_codes
            .lock()
            .expect("pair code table poisoned")
            .iter()
            .map(|(peer, code)| (peer.clone(), code.clone()))
            .collect()
    }

    /// Answer a peer's pairing challenge with the code it displays.
    pub fn submit_pair_code(&self, peer_device_id: &str, code: &str) -> Result<()> {
        self.api_tx
            .send(Internal::Api(ApiCmd::SubmitPairCode {
                peer_device_id: peer_device_id.to_string(),
                code: code.to_string(),
            }))
            .map_err(|_| anyhow!("node is shut down"))
    }

    /// Remove a peer from the trusted set; it will need a pairing code
    /// again.
    pub fn revoke(&self, peer_device_id: &str) -> Result<bool> {
        self.trust
            .lock()
            .expect("trust manager poisoned")
            .revoke(peer_device_id)
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.events_rx
            .lock()
            .expect("event receiver poisoned")
            .take()
    }

    /// Cooperative shutdown: flushes dirty records and stops every worker.
    pub fn shutdown(&self) {
        self.sos.cancel();
    }
}

// ── Node ─────────────────────────────────────────────────────────────────────

pub struct Node;

impl Node {
    /// Bind the listener and discovery sockets, load persistent state, and
    /// start the event loop.
    pub async fn spawn(mut cfg: Config) -> Result<NodeHandle> {
        let store = StateStore::open(cfg.state_dir())?;
        let identity = DeviceIdentity::load_or_create(&store)?;
        let trust = Arc::new(Mutex::new(TrustManager::load(store.clone())?));
        let manager = Arc::new(Mutex::new(TransferStateManager::new(
            store,
            cfg.chunks_per_sync,
            cfg.state_sync_interval,
        )));
        let sos = SignalOfStop::new();

        let listener = TcpListener::bind(("0.0.0.0", cfg.tcp_port))
            .await
            .with_context(|| format!("binding session listener on TCP {}", cfg.tcp_port))?;
        let tcp_addr = listener.local_addr()?;
        // An ephemeral listener port must be what discovery advertises.
        cfg.tcp_port = tcp_addr.port();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();
        let discovery = Discovery::spawn(&cfg, &identity, disc_tx, sos.clone()).await?;
        let disc_forward = internal_tx.clone();
        tokio::spawn(async move {
            while let Some(ev) = disc_rx.recv().await {
                if disc_forward.send(Internal::Discovery(ev)).is_err() {
                    break;
                }
            }
        });

        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let notice_forward = internal_tx.clone();
        tokio::spawn(async move {
            while let Some(n) = notice_rx.recv().await {
                if notice_forward.send(Internal::Notice(n)).is_err() {
                    break;
                }
            }
        });

        let deps = SessionDeps {
            cfg: cfg.clone(),
            identity: identity.clone(),
            trust: Arc::clone(&trust),
            manager: Arc::clone(&manager),
            events: events_tx.clone(),
            sos: sos.clone(),
        };

        // Accept loop: one session worker per inbound connection.
        {
            let deps = deps.clone();
            let notice_tx = notice_tx.clone();
            let internal_tx = internal_tx.clone();
            let sos = sos.clone();
            tokio::spawn(async move {
                loop {
                    let accepted = match sos.select(listener.accept()).await {
                        Some(Ok(accepted)) => accepted,
                        Some(Err(e)) => {
                            warn!(event = "accept_failure", error = %e, "TCP accept failed");
                            continue;
                        }
                        None => break,
                    };
                    let (stream, addr) = accepted;
                    debug!(event = "inbound_connection", addr = %addr, "Accepted connection");
                    spawn_session(
                        stream,
                        ConnectRole::Acceptor,
                        None,
                        Vec::new(),
                        &deps,
                        &notice_tx,
                        &internal_tx,
                    );
                }
            });
        }

        let jobs_table: Arc<Mutex<HashMap<JobHandle, JobEntry>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pair_codes: Arc<Mutex<HashMap<String, String>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let event_loop = EventLoop {
            cfg: cfg.clone(),
            deps,
            discovery: discovery.clone(),
            trust: Arc::clone(&trust),
            manager,
            events: events_tx,
            notice_tx,
            internal_tx: internal_tx.clone(),
            jobs: Arc::clone(&jobs_table),
            pair_codes: Arc::clone(&pair_codes),
            sessions: HashMap::new(),
            by_peer: HashMap::new(),
            early_codes: HashMap::new(),
        };
        tokio::spawn(event_loop.run(internal_rx, sos.clone()));

        info!(
            event = "node_started",
            device_id = %identity.device_id,
            tcp = %tcp_addr,
            udp_port = cfg.udp_port,
            "Node is up"
        );

        Ok(NodeHandle {
            device_id: identity.device_id,
            tcp_addr,
            api_tx: internal_tx,
            discovery,
            trust,
            jobs: jobs_table,
            pair_codes,
            events_rx: Mutex::new(Some(events_rx)),
            sos,
        })
    }
}

fn spawn_session(
    stream: TcpStream,
    role: ConnectRole,
    dialed_addr: Option<SocketAddr>,
    initial_jobs: Vec<SendJob>,
    deps: &SessionDeps,
    notice_tx: &mpsc::UnboundedSender<SessionNotice>,
    internal_tx: &mpsc::UnboundedSender<Internal>,
) {
    let session_id = Uuid::new_v4();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    for job in initial_jobs {
        let _ = cmd_tx.send(SessionCommand::Send(job));
    }
    let _ = internal_tx.send(Internal::NewSession {
        session_id,
        role,
        cmd_tx: cmd_tx.clone(),
        dialed_addr,
    });
    tokio::spawn(run_session(
        stream,
        role,
        session_id,
        deps.clone(),
        cmd_rx,
        notice_tx.clone(),
    ));
}

// ── Event loop ───────────────────────────────────────────────────────────────

struct EventLoop {
    cfg: Config,
    deps: SessionDeps,
    discovery: Discovery,
    trust: Arc<Mutex<TrustManager>>,
    manager: Arc<Mutex<TransferStateManager>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    jobs: Arc<Mutex<HashMap<JobHandle, JobEntry>>>,
    pair_codes: Arc<Mutex<HashMap<String, String>>>,
    sessions: HashMap<Uuid, SessionEntry>,
    by_peer: HashMap<String, Uuid>,
    /// Codes submitted before the peer's session reported its identity.
    /// Applied as soon as the handshake names the peer.
    early_codes: HashMap<String, String>,
}

impl EventLoop {
    async fn run(mut self, mut internal_rx: mpsc::UnboundedReceiver<Internal>, sos: SignalOfStop) {
        loop {
            let item = tokio::select! {
                item = internal_rx.recv() => item,
                _ = sos.wait() => break,
            };
            let Some(item) = item else { break };
            match item {
                Internal::NewSession {
                    session_id,
                    role,
                    cmd_tx,
                    dialed_addr,
                } => {
                    self.sessions.insert(
                        session_id,
                        SessionEntry {
                            cmd_tx,
                            role,
                            peer: None,
                            dialed_addr,
                            established_addr: None,
                        },
                    );
                }
                Internal::Notice(notice) => self.on_notice(notice),
                Internal::Discovery(ev) => {
                    let _ = self.events.send(match ev {
                        DiscoveryEvent::Found(peer) => NodeEvent::PeerDiscovered(peer),
                        DiscoveryEvent::Lost { device_id } => NodeEvent::PeerLost { device_id },
                    });
                }
                Internal::Api(cmd) => self.on_api(cmd).await,
                Internal::ReconnectDone {
                    peer_device_id,
                    stream,
                    jobs,
                } => {
                    if let Some(stream) = stream {
                        info!(
                            event = "session_resuming",
                            peer = %peer_device_id,
                            jobs = jobs.len(),
                            "Re-establishing session after reconnect"
                        );
                        for job in &jobs {
                            job.shared.set_state(JobState::Queued);
                        }
                        let dialed = stream.peer_addr().ok();
                        spawn_session(
                            stream,
                            ConnectRole::Initiator,
                            dialed,
                            jobs,
                            &self.deps,
                            &self.notice_tx,
                            &self.internal_tx,
                        );
                    }
                }
            }
        }

        // Graceful shutdown: nothing dirty may stay in memory.
        self.manager
            .lock()
            .expect("transfer manager poisoned")
            .flush_all();
        debug!(event = "node_stopped", "Node event loop exited");
    }

    fn on_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::PeerIdentified {
                session_id,
                peer_device_id,
            } => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.peer = Some(peer_device_id.clone());
                    if let Some(code) = self.early_codes.remove(&peer_device_id) {
                        let _ = entry.cmd_tx.send(SessionCommand::SubmitPairCode(code));
                    }
                }
                self.by_peer.insert(peer_device_id, session_id);
            }
            SessionNotice::PairCode {
                peer_device_id,
                code,
                ..
            } => {
                self.pair_codes
                    .lock()
                    .expect("pair code table poisoned")
                    .insert(peer_device_id, code);
            }
            SessionNotice::Established {
                session_id,
                peer_device_id,
                peer_addr,
                ..
            } => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    entry.peer = Some(peer_device_id.clone());
                    entry.established_addr = Some(peer_addr);
                }
                self.by_peer.insert(peer_device_id.clone(), session_id);
                self.pair_codes
                    .lock()
                    .expect("pair code table poisoned")
                    .remove(&peer_device_id);
            }
            SessionNotice::Ended {
                session_id,
                peer_device_id,
                error,
                unfinished,
            } => {
                let entry = self.sessions.remove(&session_id);
                if let Some(peer) = &peer_device_id {
                    if self.by_peer.get(peer) == Some(&session_id) {
                        self.by_peer.remove(peer);
                    }
                    self.pair_codes
                        .lock()
                        .expect("pair code table poisoned")
                        .remove(peer);
                }

                let recoverable = error.as_ref().is_some_and(|e| e.is_recoverable());
                match (recoverable, peer_device_id, unfinished) {
                    (true, Some(peer), jobs) if !jobs.is_empty() => {
                        self.start_reconnect(peer, entry, jobs);
                    }
                    (_, peer, jobs) => {
                        // Non-recoverable end: whatever was queued fails or
                        // stalls in place.
                        if let Some(err) = error {
                            let peer = peer.unwrap_or_default();
                            let mut seen = std::collections::HashSet::new();
                            for job in jobs {
                                job.shared.set_state(JobState::Failed(err.kind()));
                                if seen.insert(job.job_id) {
                                    let _ = self.events.send(NodeEvent::TransferFailed {
                                        job: Some(job.job_id),
                                        peer_device_id: peer.clone(),
                                        file_name: job.file_name.clone(),
                                        kind: err.kind(),
                                        detail: err.to_string(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn start_reconnect(&self, peer: String, entry: Option<SessionEntry>, jobs: Vec<SendJob>) {
        let direct_addr = entry.and_then(|e| match e.role {
            ConnectRole::Initiator => e.dialed_addr.or(e.established_addr),
            // For accepted sessions the peer's source port is ephemeral;
            // assume it listens on the configured session port.
            ConnectRole::Acceptor => e
                .established_addr
                .map(|a| SocketAddr::new(a.ip(), self.cfg.tcp_port)),
        });
        let direct_addr = direct_addr.or_else(|| {
            self.trust
                .lock()
                .expect("trust manager poisoned")
                .get(&peer)
                .and_then(|r| r.last_known_ip.parse().ok())
                .map(|ip| SocketAddr::new(ip, self.cfg.tcp_port))
        });

        let cfg = self.cfg.clone();
        let trust = Arc::clone(&self.trust);
        let manager = Arc::clone(&self.manager);
        let discovery = self.discovery.clone();
        let events = self.events.clone();
        let internal = self.internal_tx.clone();
        let sos = self.deps.sos.clone();
        tokio::spawn(async move {
            let plan = ReconnectPlan {
                peer_device_id: peer.clone(),
                direct_addr,
                jobs,
            };
            let stream =
                run_reconnect(&cfg, &trust, &manager, &discovery, &events, &plan, &sos).await;
            let _ = internal.send(Internal::ReconnectDone {
                peer_device_id: peer,
                stream,
                jobs: plan.jobs,
            });
        });
    }

    async fn on_api(&mut self, cmd: ApiCmd) {
        match cmd {
            ApiCmd::Send {
                path,
                peer_device_id,
                reply,
            } => {
                let _ = reply.send(self.submit_send(path, peer_device_id));
            }
            ApiCmd::Connect { addr } => self.dial(addr, Vec::new()),
            ApiCmd::SubmitPairCode {
                peer_device_id,
                code,
            } => {
                let entry = self
                    .by_peer
                    .get(&peer_device_id)
                    .and_then(|id| self.sessions.get(id));
                match entry {
                    Some(entry) => {
                        let _ = entry.cmd_tx.send(SessionCommand::SubmitPairCode(code));
                    }
                    None => {
                        // The handshake may still be in flight; hold the
                        // code until the session names this peer.
                        debug!(
                            event = "pair_code_held",
                            peer = %peer_device_id,
                            "No session knows this peer yet, holding the code"
                        );
                        self.early_codes.insert(peer_device_id, code);
                    }
                }
            }
        }
    }

    fn submit_send(&mut self, path: PathBuf, peer_device_id: String) -> Result<JobHandle> {
        let job_id = Uuid::new_v4();
        let (file_jobs, shared) = jobs::expand(&path, job_id)?;
        let cancel = file_jobs[0].cancel.clone();
        self.jobs.lock().expect("job table poisoned").insert(
            job_id,
            JobEntry {
                shared: Arc::clone(&shared),
                cancel,
            },
        );

        // An existing live session takes the jobs directly (FIFO after
        // whatever is queued there).
        if let Some(session_id) = self.by_peer.get(&peer_device_id) {
            if let Some(entry) = self.sessions.get(session_id) {
                for job in file_jobs {
                    let _ = entry.cmd_tx.send(SessionCommand::Send(job));
                }
                return Ok(job_id);
            }
        }

        // No session yet: resolve an address and dial.
        let addr = self
            .discovery
            .get(&peer_device_id)
            .map(|p| p.addr())
            .or_else(|| {
                self.trust
                    .lock()
                    .expect("trust manager poisoned")
                    .get(&peer_device_id)
                    .and_then(|r| r.last_known_ip.parse().ok())
                    .map(|ip| SocketAddr::new(ip, self.cfg.tcp_port))
            })
            .ok_or_else(|| {
                anyhow!("peer {peer_device_id} is neither discovered nor remembered")
            })?;
        self.dial(addr, file_jobs);
        Ok(job_id)
    }

    fn dial(&self, addr: SocketAddr, jobs: Vec<SendJob>) {
        let deps = self.deps.clone();
        let notice_tx = self.notice_tx.clone();
        let internal_tx = self.internal_tx.clone();
        let events = self.events.clone();
        let connect_timeout = self.cfg.connect_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    spawn_session(
                        stream,
                        ConnectRole::Initiator,
                        Some(addr),
                        jobs,
                        &deps,
                        &notice_tx,
                        &internal_tx,
                    );
                }
                other => {
                    let detail = match other {
                        Ok(Err(e)) => e.to_string(),
                        _ => "connect timeout".into(),
                    };
                    warn!(event = "dial_failure", addr = %addr, error = %detail, "Could not reach peer");
                    let mut seen = std::collections::HashSet::new();
                    for job in jobs {
                        job.shared.set_state(JobState::Failed(ErrorKind::Transport));
                        if seen.insert(job.job_id) {
                            let _ = events.send(NodeEvent::TransferFailed {
                                job: Some(job.job_id),
                                peer_device_id: String::new(),
                                file_name: job.file_name.clone(),
                                kind: ErrorKind::Transport,
                                detail: detail.clone(),
                            });
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn node_config(dir: &std::path::Path, udp_port: u16, peer_udp_port: u16) -> Config {
        Config {
            tcp_port: 0,
            udp_port,
            broadcast_addr: SocketAddr::from(([127, 0, 0, 1], peer_udp_port)),
            chunk_size: 1024,
            beacon_interval: Duration::from_millis(100),
            discovery_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(2),
            download_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<NodeEvent>, mut pred: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("event timeout")
                .expect("event stream closed");
            if pred(&ev) {
                return ev;
            }
        }
    }

    /// End-to-end: discover, pair with the displayed code, transfer a
    /// file, and verify both sides clean up.
    #[tokio::test]
    async fn discover_pair_and_transfer() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let udp_a = free_udp_port();
        let udp_b = free_udp_port();

        let a = Node::spawn(node_config(dir_a.path(), udp_a, udp_b))
            .await
            .unwrap();
        let b = Node::spawn(node_config(dir_b.path(), udp_b, udp_a))
            .await
            .unwrap();
        let mut events_a = a.events().unwrap();
        let mut events_b = b.events().unwrap();

        // A discovers B by beacon.
        wait_for(&mut events_a, |ev| {
            matches!(ev, NodeEvent::PeerDiscovered(p) if p.device_id == b.device_id())
        })
        .await;
        assert!(a
            .list_peers()
            .iter()
            .any(|p| p.device_id == b.device_id()));

        // Submitting a send to the discovered (but unpaired) peer starts
        // the session and the pairing dance.
        let src = dir_a.path().join("hello.txt");
        let body: Vec<u8> = (0..200u8).collect();
        std::fs::write(&src, &body).unwrap();
        let job = a.send(&src, b.device_id()).await.unwrap();

        // B displays a code; it is also queryable.
        let code = match wait_for(&mut events_b, |ev| {
            matches!(ev, NodeEvent::PairRequest { code: Some(_), .. })
        })
        .await
        {
            NodeEvent::PairRequest { code: Some(c), .. } => c,
            _ => unreachable!(),
        };
        assert!(b
            .pending_pair_codes()
            .iter()
            .any(|(peer, c)| peer == a.device_id() && *c == code));

        // A is prompted and submits the code.
        wait_for(&mut events_a, |ev| {
            matches!(ev, NodeEvent::PairRequest { code: None, .. })
        })
        .await;
        a.submit_pair_code(b.device_id(), &code).unwrap();

        // The queued job now flows to completion.
        wait_for(&mut events_a, |ev| {
            matches!(ev, NodeEvent::TransferComplete { job: Some(j), .. } if *j == job)
        })
        .await;
        let received = match wait_for(&mut events_b, |ev| {
            matches!(ev, NodeEvent::TransferComplete { path: Some(_), .. })
        })
        .await
        {
            NodeEvent::TransferComplete { path: Some(p), .. } => p,
            _ => unreachable!(),
        };
        assert_eq!(std::fs::read(&received).unwrap(), body);

        let progress = a.progress(job).unwrap();
        assert_eq!(progress.state, JobState::Complete);
        assert_eq!(progress.bytes_done, 200);

        // Pairing persisted on both ends; the code display is cleared.
        assert!(a.trust.lock().unwrap().is_trusted(b.device_id()));
        assert!(b.trust.lock().unwrap().is_trusted(a.device_id()));
        assert!(b.pending_pair_codes().is_empty());

        a.shutdown();
        b.shutdown();
    }

    /// A directory expands into per-file jobs under one handle, and a
    /// trusted reconnect needs no code.
    #[tokio::test]
    async fn directory_batch_to_trusted_peer() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let udp_a = free_udp_port();
        let udp_b = free_udp_port();

        let a = Node::spawn(node_config(dir_a.path(), udp_a, udp_b))
            .await
            .unwrap();
        let b = Node::spawn(node_config(dir_b.path(), udp_b, udp_a))
            .await
            .unwrap();
        let mut events_a = a.events().unwrap();
        let _events_b = b.events().unwrap();

        // Pre-trust both sides, as if paired in an earlier run.
        a.trust
            .lock()
            .unwrap()
            .trust(b.device_id(), "bob-host", "127.0.0.1")
            .unwrap();
        b.trust
            .lock()
            .unwrap()
            .trust(a.device_id(), "alice-host", "127.0.0.1")
            .unwrap();

        let batch = dir_a.path().join("album");
        std::fs::create_dir_all(batch.join("inner")).unwrap();
        std::fs::write(batch.join("one.bin"), vec![1u8; 1500]).unwrap();
        std::fs::write(batch.join("inner/two.bin"), vec![2u8; 700]).unwrap();

        wait_for(&mut events_a, |ev| {
            matches!(ev, NodeEvent::PeerDiscovered(p) if p.device_id == b.device_id())
        })
        .await;
        let job = a.send(&batch, b.device_id()).await.unwrap();

        wait_for(&mut events_a, |ev| {
            matches!(ev, NodeEvent::TransferComplete { job: Some(j), .. } if *j == job)
        })
        .await;

        let progress = a.progress(job).unwrap();
        assert_eq!(progress.state, JobState::Complete);
        assert_eq!(progress.bytes_total, 2200);
        assert_eq!(progress.bytes_done, 2200);

        // Relative structure reproduced under B's download dir.
        assert_eq!(
            std::fs::read(dir_b.path().join("album/one.bin")).unwrap(),
            vec![1u8; 1500]
        );
        assert_eq!(
            std::fs::read(dir_b.path().join("album/inner/two.bin")).unwrap(),
            vec![2u8; 700]
        );

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails_fast() {
        let dir_a = tempfile::tempdir().unwrap();
        let a = Node::spawn(node_config(dir_a.path(), free_udp_port(), free_udp_port()))
            .await
            .unwrap();
        let src = dir_a.path().join("f.txt");
        std::fs::write(&src, b"x").unwrap();

        let err = a.send(&src, "host-nobody-1").await.unwrap_err();
        assert!(err.to_string().contains("neither discovered nor remembered"));
        a.shutdown();
    }
}
