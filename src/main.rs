mod core;
mod utils;
mod workers;

use crate::core::node::{Node, NodeEvent};
use crate::workers::args::Args;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    let filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let node = Node::spawn(args.to_config()).await?;
    let mut events = node.events().expect("fresh node always has its event stream");

    if let Some(addr) = args.connect {
        node.connect(addr)?;
    }
    if let Some(path) = &args.send {
        let peer = args
            .peer
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--send requires --peer <device_id>"))?;
        // The peer may need a beacon or two to show up.
        let node_ref = &node;
        let path = path.clone();
        let mut submitted = false;
        for _ in 0..10 {
            match node_ref.send(&path, &peer).await {
                Ok(job) => {
                    info!(event = "job_submitted", job = %job, peer = %peer, "Send job queued");
                    submitted = true;
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
        if !submitted {
            warn!(event = "job_submit_failed", peer = %peer, "Peer never became reachable");
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "shutdown_requested", "Ctrl+C, flushing state");
                node.shutdown();
                break;
            }
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                report(ev);
            }
        }
    }
    Ok(())
}

/// Surface node events on the console; a graphical embedder would render
/// these instead.
fn report(ev: NodeEvent) {
    match ev {
        NodeEvent::PeerDiscovered(peer) => {
            info!(event = "peer_discovered", device_id = %peer.device_id, addr = %peer.addr(), "Peer online");
        }
        NodeEvent::PeerLost { device_id } => {
            info!(event = "peer_lost", device_id = %device_id, "Peer offline");
        }
        NodeEvent::PairRequest {
            peer_device_id,
            peer_hostname,
            code,
        } => match code {
            Some(code) => {
                info!(
                    event = "pair_code_ready",
                    peer = %peer_device_id,
                    hostname = %peer_hostname,
                    code = %code,
                    "Share this code with the peer to pair"
                );
            }
            None => {
                info!(
                    event = "pair_code_needed",
                    peer = %peer_device_id,
                    hostname = %peer_hostname,
                    "Peer expects its displayed pairing code"
                );
            }
        },
        NodeEvent::TransferStarted {
            peer_device_id,
            file_name,
            ..
        } => {
            info!(event = "transfer_started", peer = %peer_device_id, file = %file_name, "Transfer started");
        }
        NodeEvent::TransferProgress {
            file_name,
            bytes_done,
            bytes_total,
            ..
        } => {
            tracing::debug!(event = "transfer_progress", file = %file_name, bytes_done, bytes_total, "Progress");
        }
        NodeEvent::TransferComplete {
            peer_device_id,
            file_name,
            path,
            ..
        } => {
            info!(
                event = "transfer_complete",
                peer = %peer_device_id,
                file = %file_name,
                path = %path.map(|p| p.display().to_string()).unwrap_or_default(),
                "Transfer complete"
            );
        }
        NodeEvent::TransferFailed {
            peer_device_id,
            file_name,
            kind,
            detail,
            ..
        } => {
            warn!(
                event = "transfer_failed",
                peer = %peer_device_id,
                file = %file_name,
                kind = ?kind,
                detail = %detail,
                "Transfer failed"
            );
        }
        NodeEvent::Reconnecting { peer_device_id } => {
            info!(event = "reconnecting", peer = %peer_device_id, "Connection lost, reconnecting");
        }
        NodeEvent::Reconnected { peer_device_id } => {
            info!(event = "reconnected", peer = %peer_device_id, "Session re-established");
        }
    }
}
