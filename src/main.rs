use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshkit::{MemoryLink, MeshEvent, MeshNode, MEMORY_LINK_CAPACITY};

#[derive(Parser, Debug)]
#[command(name = "meshkit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of in-process nodes to run, wired as a line topology.
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Seconds between network stats reports.
    #[arg(short, long, default_value = "10")]
    stats_interval: u64,

    /// Seconds between demo broadcasts from the first node.
    #[arg(short, long, default_value = "5")]
    message_interval: u64,
}

/// Wire two nodes together over an in-memory link and pump their inbound
/// frames back into the engines.
async fn connect(a: &MeshNode, b: &MeshNode) -> Result<()> {
    let ((a_half, mut a_rx), (b_half, mut b_rx)) = MemoryLink::pair(MEMORY_LINK_CAPACITY);

    a.add_peer(b.device_id().clone(), Arc::new(a_half), true)
        .await?;
    b.add_peer(a.device_id().clone(), Arc::new(b_half), false)
        .await?;

    let a_pump = a.clone();
    let b_id = b.device_id().clone();
    tokio::spawn(async move {
        while let Some(frame) = a_rx.recv().await {
            if a_pump.handle_frame(b_id.clone(), frame).await.is_err() {
                break;
            }
        }
    });

    let b_pump = b.clone();
    let a_id = a.device_id().clone();
    tokio::spawn(async move {
        while let Some(frame) = b_rx.recv().await {
            if b_pump.handle_frame(a_id.clone(), frame).await.is_err() {
                break;
            }
        }
    });

    Ok(())
}

fn log_events(name: String, mut events: tokio::sync::mpsc::Receiver<MeshEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                MeshEvent::PeerConnected {
                    device_id,
                    is_initiator,
                } => info!(node = %name, peer = %device_id, is_initiator, "peer connected"),
                MeshEvent::PeerTimeout { device_id } => {
                    warn!(node = %name, peer = %device_id, "peer timed out")
                }
                MeshEvent::MessageStatus {
                    message_id,
                    status,
                    attempts,
                    error,
                } => info!(
                    node = %name,
                    message_id = %message_id,
                    status = %status,
                    attempts,
                    error = error.as_deref().unwrap_or(""),
                    "message status"
                ),
                MeshEvent::MeshMessage { from, frame } => {
                    info!(node = %name, from = %from, payload = %frame, "mesh message")
                }
                MeshEvent::MeshHealth {
                    redundancy,
                    avg_hop_count,
                    stability,
                } => info!(
                    node = %name,
                    redundancy = format!("{:.2}", redundancy),
                    avg_hop_count = format!("{:.2}", avg_hop_count),
                    stability = format!("{:.2}", stability),
                    "mesh health"
                ),
                MeshEvent::MeshDiscovery { snapshot } => info!(
                    node = %name,
                    direct_peers = snapshot.direct_peers.len(),
                    known_nodes = snapshot.nodes.len(),
                    "topology snapshot"
                ),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node_count = args.nodes.max(2);
    let mut nodes = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let name = format!("node-{}", i);
        let (node, events) = MeshNode::spawn(name.clone());
        log_events(name, events);
        nodes.push(node);
    }

    // Line topology: messages from one end reach the other only via relay.
    for pair in nodes.windows(2) {
        connect(&pair[0], &pair[1]).await?;
    }
    info!(nodes = node_count, "mesh running");

    let mut stats_interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));
    let mut message_interval = time::interval(Duration::from_secs(args.message_interval.max(1)));
    let mut counter: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            _ = message_interval.tick() => {
                counter += 1;
                let id = nodes[0]
                    .send(json!({
                        "type": "counterUpdate",
                        "code": format!("C{:04}", counter),
                        "isPresent": true,
                        "timestamp": meshkit::epoch_ms(),
                    }))
                    .await?;
                info!(message_id = %id, counter, "broadcast submitted");
            }
            _ = stats_interval.tick() => {
                for node in &nodes {
                    let stats = node.network_stats().await?;
                    info!(
                        node = %node.device_id(),
                        avg_latency_ms = format!("{:.1}", stats.average_latency_ms),
                        packet_loss = format!("{:.3}", stats.packet_loss),
                        keepalive_ms = format!("{:.0}", stats.keepalive_interval_ms),
                        "network stats"
                    );
                }
            }
        }
    }

    for node in &nodes {
        node.quit().await;
    }
    Ok(())
}
