//! Interactive attendance-counter mesh.
//!
//! Spins up a small in-process mesh and broadcasts a counter mark for every
//! code typed on stdin. Every node prints the marks it sees arrive, along
//! with delivery status for the submitting node.
//!
//!     cargo run --example attendance -- --nodes 4

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use meshkit::{MemoryLink, MeshEvent, MeshNode, Priority, MEMORY_LINK_CAPACITY};

#[derive(Parser, Debug)]
#[command(name = "attendance")]
#[command(about = "Broadcast attendance marks across an in-process mesh")]
struct Args {
    /// Number of nodes in the ring.
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Event id stamped on every mark.
    #[arg(long, default_value = "demo-event")]
    event_id: String,
}

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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let node_count = args.nodes.max(2);

    let mut nodes = Vec::with_capacity(node_count);
    for i in 0..node_count {
        let name = format!("counter-{}", i);
        let (node, mut events) = MeshNode::spawn(name.clone());
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MeshEvent::MeshMessage { from, frame } => {
                        let code = frame.get("code").and_then(|v| v.as_str()).unwrap_or("?");
                        println!("[{}] mark {} (via {})", name, code, from);
                    }
                    MeshEvent::MessageStatus {
                        message_id,
                        status,
                        attempts,
                        ..
                    } => {
                        println!("[{}] {} -> {} after {} attempt(s)", name, message_id, status, attempts);
                    }
                    MeshEvent::PeerTimeout { device_id } => {
                        println!("[{}] peer {} timed out", name, device_id);
                    }
                    _ => {}
                }
            }
        });
        nodes.push(node);
    }

    // Ring topology: marks cross the mesh by relay in both directions.
    // Two nodes form a single link, not a doubled one.
    let edges = if node_count == 2 { 1 } else { node_count };
    for i in 0..edges {
        connect(&nodes[i], &nodes[(i + 1) % node_count]).await?;
    }

    println!(
        "{} nodes up. Type an attendee code (or 'stats', or 'quit'):",
        node_count
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        match input {
            "" => continue,
            "quit" => break,
            "stats" => {
                for node in &nodes {
                    let stats = node.network_stats().await?;
                    println!(
                        "[{}] latency {:.1}ms loss {:.3} keepalive {:.0}ms",
                        node.device_id(),
                        stats.average_latency_ms,
                        stats.packet_loss,
                        stats.keepalive_interval_ms,
                    );
                }
            }
            code => {
                let id = nodes[0]
                    .send_with(
                        json!({
                            "type": "counterUpdate",
                            "code": code,
                            "isPresent": true,
                            "eventId": args.event_id,
                            "timestamp": meshkit::epoch_ms(),
                        }),
                        None,
                        None,
                        Some(Priority::High),
                    )
                    .await?;
                println!("[{}] submitted {} as {}", nodes[0].device_id(), code, id);
            }
        }
    }

    for node in &nodes {
        node.quit().await;
    }
    Ok(())
}
