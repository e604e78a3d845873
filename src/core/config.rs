//! Centralized configuration for the share service.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in
//! a single place. Wire-format constants (frame type bytes, header sizes)
//! stay in the protocol module.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ── Protocol ─────────────────────────────────────────────────────────────────

/// Protocol version carried in every HELLO. A mismatch is session-fatal.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed framing overhead allowed on top of a chunk payload. Any frame
/// longer than `chunk_size + FRAME_OVERHEAD` is a protocol violation.
pub const FRAME_OVERHEAD: usize = 64;

// ── Pairing ──────────────────────────────────────────────────────────────────

/// Number of decimal digits in a pairing code.
pub const PAIR_CODE_LEN: usize = 6;

/// Pairing attempts allowed within one session before it is terminated.
pub const MAX_PAIR_FAILURES: u32 = 3;

// ── Session ──────────────────────────────────────────────────────────────────

/// How long a closing session drains in-flight ACKs before dropping the
/// transport.
pub const CLOSING_DRAIN: Duration = Duration::from_secs(2);

/// A discovered peer is dropped from the table after this many beacon
/// intervals without a fresh announcement.
pub const PEER_TTL_BEACONS: u32 = 3;

/// How long an accepting session waits for the initiator to submit a
/// pairing code before giving up. Generous: a human is typing.
pub const PAIRING_WAIT: Duration = Duration::from_secs(300);

// ── Runtime configuration ────────────────────────────────────────────────────

/// Runtime configuration with the service defaults. Built once at startup
/// (CLI + optional TOML file) and passed down explicitly — no process-wide
/// mutable state.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port for sessions.
    pub tcp_port: u16,
    /// UDP port for discovery.
    pub udp_port: u16,
    /// Chunk size in bytes for new transfers. Recorded per transfer so a
    /// default upgrade never corrupts an in-progress resume.
    pub chunk_size: u32,
    /// How long the sender waits for a chunk ACK before retrying.
    pub ack_timeout: Duration,
    /// Retries per chunk before the transfer raises a recoverable error.
    pub max_retry: u32,
    /// Interval between outgoing heartbeats on a live session.
    pub heartbeat_interval: Duration,
    /// Silence (no frame of any kind) after which a session is failed.
    pub heartbeat_timeout: Duration,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Direct reconnect attempts before falling back to discovery.
    pub max_reconnect_attempts: u32,
    /// Dirty transfer progress is flushed at least this often.
    pub state_sync_interval: Duration,
    /// Progress is flushed after this many newly completed chunks.
    pub chunks_per_sync: u32,
    /// How long a targeted discovery lookup waits for a response.
    pub discovery_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Interval between discovery announce beacons.
    pub beacon_interval: Duration,
    /// Where announce beacons and discover probes are sent. The default is
    /// the limited broadcast address on the discovery port; pointing it at
    /// a unicast address supports same-machine setups and tests.
    pub broadcast_addr: SocketAddr,
    /// Where completed files land. State lives under `.lan_share/` inside.
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("LanShare");
        Self {
            tcp_port: 9527,
            udp_port: 9528,
            chunk_size: 64 * 1024,
            ack_timeout: Duration::from_secs(60),
            max_retry: 3,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            state_sync_interval: Duration::from_secs(5),
            chunks_per_sync: 50,
            discovery_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            beacon_interval: Duration::from_secs(5),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], 9528)),
            download_dir,
        }
    }
}

impl Config {
    /// Root of all persistent state.
    pub fn state_dir(&self) -> PathBuf {
        self.download_dir.join(".lan_share")
    }

    /// Largest frame a peer may legally send on a session using this
    /// configuration's chunk size.
    pub fn max_frame(&self) -> usize {
        self.chunk_size as usize + FRAME_OVERHEAD
    }

    /// How long a discovered peer survives without a fresh beacon.
    pub fn peer_ttl(&self) -> Duration {
        self.beacon_interval * PEER_TTL_BEACONS
    }
}
