//! UDP device discovery.
//!
//! One worker owns the UDP socket and does three things:
//!
//! - broadcasts an `announce` beacon every `beacon_interval`, so peers can
//!   keep a table of who is reachable and where;
//! - answers `discover` probes that name this device (or name nobody),
//!   unicast back to the asker;
//! - resolves targeted lookups for the reconnect supervisor when a trusted
//!   peer's IP has changed.
//!
//! Datagrams are small JSON objects. Self-announcements are dropped, and a
//! peer that stops beaconing is evicted after `peer_ttl`.

use crate::core::config::Config;
use crate::core::identity::DeviceIdentity;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

// ── Datagram schema ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Datagram {
    Announce {
        device_id: String,
        hostname: String,
        tcp_port: u16,
    },
    Discover {
        /// Empty means "anyone": every listener answers.
        #[serde(default)]
        target_device_id: String,
    },
    DiscoverResponse {
        device_id: String,
        hostname: String,
        tcp_port: u16,
    },
}

// ── Public types ─────────────────────────────────────────────────────────────

/// A peer currently visible on the network. Ephemeral: lives only in the
/// discovery table, evicted when its beacons stop.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub device_id: String,
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
    pub last_beacon_at: Instant,
}

impl DiscoveredPeer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Table change notifications for the node's event stream.
#[derive(Debug)]
pub enum DiscoveryEvent {
    Found(DiscoveredPeer),
    Lost { device_id: String },
}

struct Lookup {
    target: String,
    reply: oneshot::Sender<SocketAddr>,
}

/// Handle to the discovery worker. Cheap to clone.
#[derive(Clone)]
pub struct Discovery {
    peers: Arc<Mutex<HashMap<String, DiscoveredPeer>>>,
    lookup_tx: mpsc::Sender<Lookup>,
    discovery_timeout: std::time::Duration,
}

impl Discovery {
    /// Bind the UDP socket and spawn the worker.
    pub async fn spawn(
        cfg: &Config,
        identity: &DeviceIdentity,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        sos: SignalOfStop,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", cfg.udp_port))
            .await
            .with_context(|| format!("binding discovery socket on UDP {}", cfg.udp_port))?;
        socket
            .set_broadcast(true)
            .context("enabling SO_BROADCAST")?;

        let peers = Arc::new(Mutex::new(HashMap::new()));
        let (lookup_tx, lookup_rx) = mpsc::channel(16);

        let worker = Worker {
            socket: Arc::new(socket),
            cfg: cfg.clone(),
            device_id: identity.device_id.clone(),
            hostname: identity.hostname.clone(),
            peers: Arc::clone(&peers),
            events,
            waiters: HashMap::new(),
        };
        tokio::spawn(worker.run(lookup_rx, sos));

        Ok(Self {
            peers,
            lookup_tx,
            discovery_timeout: cfg.discovery_timeout,
        })
    }

    /// Currently visible peers.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        let mut list: Vec<DiscoveredPeer> = self
            .peers
            .lock()
            .expect("discovery table poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    pub fn get(&self, device_id: &str) -> Option<DiscoveredPeer> {
        self.peers
            .lock()
            .expect("discovery table poisoned")
            .get(device_id)
            .cloned()
    }

    /// Broadcast a targeted probe and wait for the matching peer to answer
    /// with its session address. `None` on timeout.
    pub async fn lookup(&self, target_device_id: &str) -> Option<SocketAddr> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.lookup_tx
            .send(Lookup {
                target: target_device_id.to_string(),
                reply: reply_tx,
            })
            .await
            .ok()?;
        tokio::time::timeout(self.discovery_timeout, reply_rx)
            .await
            .ok()?
            .ok()
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

struct Worker {
    socket: Arc<UdpSocket>,
    cfg: Config,
    device_id: String,
    hostname: String,
    peers: Arc<Mutex<HashMap<String, DiscoveredPeer>>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    waiters: HashMap<String, Vec<oneshot::Sender<SocketAddr>>>,
}

impl Worker {
    async fn run(mut self, mut lookups: mpsc::Receiver<Lookup>, sos: SignalOfStop) {
        let mut beacon = tokio::time::interval(self.cfg.beacon_interval);
        let socket = Arc::clone(&self.socket);
        let mut buf = vec![0u8; 4096];
        info!(
            event = "discovery_started",
            udp_port = self.cfg.udp_port,
            "Discovery worker listening"
        );

        loop {
            tokio::select! {
                _ = sos.wait() => break,
                _ = beacon.tick() => {
                    self.send_announce().await;
                    self.evict_stale();
                }
                Some(lookup) = lookups.recv() => {
                    self.start_lookup(lookup).await;
                }
                recv = socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((n, src)) => self.handle_datagram(&buf[..n], src).await,
                        Err(e) => {
                            warn!(event = "discovery_recv_failure", error = %e, "UDP receive failed");
                        }
                    }
                }
            }
        }
        debug!(event = "discovery_stopped", "Discovery worker shut down");
    }

    async fn send_announce(&self) {
        let msg = Datagram::Announce {
            device_id: self.device_id.clone(),
            hostname: self.hostname.clone(),
            tcp_port: self.cfg.tcp_port,
        };
        self.send_to(&msg, self.cfg.broadcast_addr).await;
    }

    async fn start_lookup(&mut self, lookup: Lookup) {
        // If the peer is already beaconing we can answer immediately.
        if let Some(peer) = self
            .peers
            .lock()
            .expect("discovery table poisoned")
            .get(&lookup.target)
            .cloned()
        {
            let _ = lookup.reply.send(peer.addr());
            return;
        }
        let msg = Datagram::Discover {
            target_device_id: lookup.target.clone(),
        };
        self.waiters
            .entry(lookup.target)
            .or_default()
            .push(lookup.reply);
        self.send_to(&msg, self.cfg.broadcast_addr).await;
    }

    async fn handle_datagram(&mut self, data: &[u8], src: SocketAddr) {
        let msg: Datagram = match serde_json::from_slice(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(event = "discovery_bad_datagram", src = %src, error = %e, "Ignoring undecodable datagram");
                return;
            }
        };

        match msg {
            Datagram::Announce {
                device_id,
                hostname,
                tcp_port,
            } => {
                if device_id == self.device_id {
                    return;
                }
                self.upsert_peer(device_id, hostname, src.ip(), tcp_port);
            }
            Datagram::Discover { target_device_id } => {
                if target_device_id.is_empty() || target_device_id == self.device_id {
                    let reply = Datagram::DiscoverResponse {
                        device_id: self.device_id.clone(),
                        hostname: self.hostname.clone(),
                        tcp_port: self.cfg.tcp_port,
                    };
                    self.send_to(&reply, src).await;
                }
            }
            Datagram::DiscoverResponse {
                device_id,
                hostname,
                tcp_port,
            } => {
                if device_id == self.device_id {
                    return;
                }
                let addr = SocketAddr::new(src.ip(), tcp_port);
                if let Some(waiters) = self.waiters.remove(&device_id) {
                    info!(
                        event = "lookup_resolved",
                        device_id = %device_id,
                        addr = %addr,
                        "Targeted discovery answered"
                    );
                    for waiter in waiters {
                        let _ = waiter.send(addr);
                    }
                }
                self.upsert_peer(device_id, hostname, src.ip(), tcp_port);
            }
        }
    }

    fn upsert_peer(&self, device_id: String, hostname: String, ip: IpAddr, port: u16) {
        let mut table = self.peers.lock().expect("discovery table poisoned");
        let fresh = DiscoveredPeer {
            device_id: device_id.clone(),
            hostname,
            ip,
            port,
            last_beacon_at: Instant::now(),
        };
        let is_new = match table.get(&device_id) {
            Some(old) => old.ip != ip || old.port != port,
            None => true,
        };
        table.insert(device_id, fresh.clone());
        drop(table);
        if is_new {
            info!(
                event = "peer_discovered",
                device_id = %fresh.device_id,
                addr = %fresh.addr(),
                "Peer visible on the network"
            );
            let _ = self.events.send(DiscoveryEvent::Found(fresh));
        }
    }

    fn evict_stale(&self) {
        let ttl = self.cfg.peer_ttl();
        let mut lost = Vec::new();
        {
            let mut table = self.peers.lock().expect("discovery table poisoned");
            table.retain(|id, peer| {
                let keep = peer.last_beacon_at.elapsed() <= ttl;
                if !keep {
                    lost.push(id.clone());
                }
                keep
            });
        }
        for device_id in lost {
            info!(event = "peer_lost", device_id = %device_id, "Peer stopped beaconing");
            let _ = self.events.send(DiscoveryEvent::Lost { device_id });
        }
    }

    async fn send_to(&self, msg: &Datagram, dest: SocketAddr) {
        let data = match serde_json::to_vec(msg) {
            Ok(d) => d,
            Err(_) => return,
        };
        if let Err(e) = self.socket.send_to(&data, dest).await {
            debug!(event = "discovery_send_failure", dest = %dest, error = %e, "UDP send failed");
        }
    }
}
