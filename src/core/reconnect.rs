//! Reconnect supervisor.
//!
//! Runs when a session fails with transfers still pending. Strategy, in
//! order: persist everything dirty, hammer the last known address for a
//! while, then ask the network where the peer went (its IP may have
//! changed), and try again at the answer. Gives up by marking the affected
//! jobs stalled — records stay on disk, progress is never deleted.

use crate::core::config::Config;
use crate::core::discovery::Discovery;
use crate::core::error::ErrorKind;
use crate::core::jobs::{JobState, SendJob};
use crate::core::node::NodeEvent;
use crate::core::transfer::manager::TransferStateManager;
use crate::core::trust::TrustManager;
use crate::utils::sos::SignalOfStop;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

pub struct ReconnectPlan {
    pub peer_device_id: String,
    /// Best-known session address: the dialed address for sessions we
    /// initiated, `ip:tcp_port` for ones we accepted.
    pub direct_addr: Option<SocketAddr>,
    /// Send jobs interrupted by the failure, resubmitted on success.
    pub jobs: Vec<SendJob>,
}

/// Try to bring the peer back. `Some(stream)` is a fresh transport ready
/// for a handshake (which will take the trusted branch); `None` means every
/// strategy failed and the jobs were marked stalled.
pub async fn run_reconnect(
    cfg: &Config,
    trust: &Arc<Mutex<TrustManager>>,
    manager: &Arc<Mutex<TransferStateManager>>,
    discovery: &Discovery,
    events: &mpsc::UnboundedSender<NodeEvent>,
    plan: &ReconnectPlan,
    sos: &SignalOfStop,
) -> Option<TcpStream> {
    // Nothing may be lost to a crash while we are busy redialing.
    manager
        .lock()
        .expect("transfer manager poisoned")
        .flush_all();

    let peer = &plan.peer_device_id;
    let _ = events.send(NodeEvent::Reconnecting {
        peer_device_id: peer.clone(),
    });
    info!(
        event = "reconnect_started",
        peer = %peer,
        direct = %plan.direct_addr.map(|a| a.to_string()).unwrap_or_default(),
        "Attempting to re-establish session"
    );

    if let Some(addr) = plan.direct_addr {
        if let Some(stream) = connect_loop(cfg, addr, sos).await {
            let _ = events.send(NodeEvent::Reconnected {
                peer_device_id: peer.clone(),
            });
            return Some(stream);
        }
    }

    // The peer may have moved: ask by device id.
    if !sos.cancelled() {
        if let Some(addr) = discovery.lookup(peer).await {
            info!(
                event = "reconnect_rediscovered",
                peer = %peer,
                addr = %addr,
                "Peer answered targeted discovery at a new address"
            );
            let _ = trust
                .lock()
                .expect("trust manager poisoned")
                .touch(peer, &addr.ip().to_string());
            if let Some(stream) = connect_loop(cfg, addr, sos).await {
                let _ = events.send(NodeEvent::Reconnected {
                    peer_device_id: peer.clone(),
                });
                return Some(stream);
            }
        }
    }

    warn!(
        event = "reconnect_exhausted",
        peer = %peer,
        "All reconnect strategies failed; transfers stalled"
    );
    let mut seen = HashSet::new();
    for job in &plan.jobs {
        job.shared.set_state(JobState::Stalled);
        if seen.insert(job.job_id) {
            let _ = events.send(NodeEvent::TransferFailed {
                job: Some(job.job_id),
                peer_device_id: peer.clone(),
                file_name: job.file_name.clone(),
                kind: ErrorKind::Transport,
                detail: "reconnect exhausted; transfer stalled, records kept".into(),
            });
        }
    }
    None
}

/// Up to `max_reconnect_attempts` dials spaced `reconnect_interval` apart.
async fn connect_loop(cfg: &Config, addr: SocketAddr, sos: &SignalOfStop) -> Option<TcpStream> {
    for attempt in 1..=cfg.max_reconnect_attempts {
        if sos.cancelled() {
            return None;
        }
        match timeout(cfg.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                info!(
                    event = "reconnect_connected",
                    addr = %addr,
                    attempt,
                    "Transport re-established"
                );
                return Some(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(event = "reconnect_attempt_failed", addr = %addr, attempt, error = %e, "Dial failed");
            }
            Err(_) => {
                tracing::debug!(event = "reconnect_attempt_timeout", addr = %addr, attempt, "Dial timed out");
            }
        }
        if attempt < cfg.max_reconnect_attempts {
            sos.select(tokio::time::sleep(cfg.reconnect_interval)).await?;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::discovery::DiscoveryEvent;
    use crate::core::identity::DeviceIdentity;
    use crate::core::store::StateStore;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Rig {
        _dir: tempfile::TempDir,
        cfg: Config,
        trust: Arc<Mutex<TrustManager>>,
        manager: Arc<Mutex<TransferStateManager>>,
        identity: DeviceIdentity,
    }

    fn rig(udp_port: u16, peer_udp_port: u16) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let identity = DeviceIdentity::load_or_create(&store).unwrap();
        let trust = Arc::new(Mutex::new(TrustManager::load(store.clone()).unwrap()));
        let manager = Arc::new(Mutex::new(TransferStateManager::new(
            store,
            50,
            Duration::from_secs(3600),
        )));
        let cfg = Config {
            udp_port,
            broadcast_addr: SocketAddr::from(([127, 0, 0, 1], peer_udp_port)),
            reconnect_interval: Duration::from_millis(40),
            max_reconnect_attempts: 4,
            connect_timeout: Duration::from_millis(300),
            discovery_timeout: Duration::from_millis(400),
            beacon_interval: Duration::from_millis(100),
            ..Config::default()
        };
        Rig {
            _dir: dir,
            cfg,
            trust,
            manager,
            identity,
        }
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn free_tcp_addr() -> SocketAddr {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
    }

    async fn spawn_discovery(rig: &Rig, sos: &SignalOfStop) -> Discovery {
        let (tx, _rx) = mpsc::unbounded_channel::<DiscoveryEvent>();
        Discovery::spawn(&rig.cfg, &rig.identity, tx, sos.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn direct_reconnect_when_peer_comes_back() {
        let rig = rig(free_udp_port(), free_udp_port());
        let sos = SignalOfStop::new();
        let discovery = spawn_discovery(&rig, &sos).await;
        let (events, mut events_rx) = mpsc::unbounded_channel();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let plan = ReconnectPlan {
            peer_device_id: "host-bob-1".into(),
            direct_addr: Some(addr),
            jobs: Vec::new(),
        };
        let stream = run_reconnect(
            &rig.cfg,
            &rig.trust,
            &rig.manager,
            &discovery,
            &events,
            &plan,
            &sos,
        )
        .await;
        assert!(stream.is_some());

        assert!(matches!(
            events_rx.try_recv().unwrap(),
            NodeEvent::Reconnecting { .. }
        ));
        assert!(matches!(
            events_rx.try_recv().unwrap(),
            NodeEvent::Reconnected { .. }
        ));
        sos.cancel();
    }

    #[tokio::test]
    async fn exhaustion_marks_jobs_stalled() {
        let rig = rig(free_udp_port(), free_udp_port());
        let sos = SignalOfStop::new();
        let discovery = spawn_discovery(&rig, &sos).await;
        let (events, mut events_rx) = mpsc::unbounded_channel();

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("f.bin");
        std::fs::write(&src, b"data").unwrap();
        let (jobs, shared) = crate::core::jobs::expand(&src, uuid::Uuid::new_v4()).unwrap();

        let plan = ReconnectPlan {
            peer_device_id: "host-gone-1".into(),
            // Nothing listens here.
            direct_addr: Some(free_tcp_addr()),
            jobs,
        };
        let stream = run_reconnect(
            &rig.cfg,
            &rig.trust,
            &rig.manager,
            &discovery,
            &events,
            &plan,
            &sos,
        )
        .await;
        assert!(stream.is_none());
        assert_eq!(shared.state(), JobState::Stalled);

        let mut saw_failed = false;
        while let Ok(ev) = events_rx.try_recv() {
            if let NodeEvent::TransferFailed { kind, .. } = ev {
                assert_eq!(kind, ErrorKind::Transport);
                saw_failed = true;
            }
        }
        assert!(saw_failed);
        sos.cancel();
    }

    /// The peer moved: direct dials fail, targeted discovery answers with
    /// the new address, and the connect loop restarts against it.
    #[tokio::test]
    async fn discovery_fallback_finds_the_new_address() {
        let port_a = free_udp_port();
        let port_b = free_udp_port();
        let rig_a = rig(port_a, port_b);
        let sos = SignalOfStop::new();
        let discovery_a = spawn_discovery(&rig_a, &sos).await;

        // The peer's new home: a live listener, announced by its own
        // discovery worker.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let new_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut rig_b = rig(port_b, port_a);
        rig_b.cfg.tcp_port = new_addr.port();
        let _discovery_b = spawn_discovery(&rig_b, &sos).await;

        rig_a
            .trust
            .lock()
            .unwrap()
            .trust(&rig_b.identity.device_id, "bob-host", "192.168.1.10")
            .unwrap();

        let (events, _events_rx) = mpsc::unbounded_channel();
        let plan = ReconnectPlan {
            peer_device_id: rig_b.identity.device_id.clone(),
            // The stale address: connection refused there.
            direct_addr: Some(free_tcp_addr()),
            jobs: Vec::new(),
        };
        let stream = run_reconnect(
            &rig_a.cfg,
            &rig_a.trust,
            &rig_a.manager,
            &discovery_a,
            &events,
            &plan,
            &sos,
        )
        .await
        .expect("discovery fallback should reconnect");
        assert_eq!(stream.peer_addr().unwrap(), new_addr);

        // The trust record now carries the fresh IP.
        let ip = rig_a
            .trust
            .lock()
            .unwrap()
            .get(&rig_b.identity.device_id)
            .unwrap()
            .last_known_ip
            .clone();
        assert_eq!(ip, "127.0.0.1");
        sos.cancel();
    }
}
