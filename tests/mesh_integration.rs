//! Integration tests for the mesh engine over the in-memory transport.
//!
//! These tests wire multiple nodes together with `MemoryLink` pairs and
//! validate the end-to-end behavior of keepalive, eviction, multi-hop
//! relay with deduplication, and retry policy. Timing-sensitive tests run
//! under tokio's paused clock, so virtual windows elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use meshkit::{
    DeliveryStatus, DeviceId, FrameSink, HealthConfig, MemoryLink, MeshConfig, MeshEvent, MeshNode,
    RetryPolicy, MEMORY_LINK_CAPACITY,
};

// =============================================================================
// Helper Functions
// =============================================================================

/// Wire two nodes together and pump their inbound frames into the engines.
async fn connect(a: &MeshNode, b: &MeshNode) {
    let ((a_half, mut a_rx), (b_half, mut b_rx)) = MemoryLink::pair(MEMORY_LINK_CAPACITY);

    a.add_peer(b.device_id().clone(), Arc::new(a_half), true)
        .await
        .expect("add_peer on a failed");
    b.add_peer(a.device_id().clone(), Arc::new(b_half), false)
        .await
        .expect("add_peer on b failed");

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
}

/// Collect every event arriving within a virtual window.
async fn drain_for(events: &mut mpsc::Receiver<MeshEvent>, window: Duration) -> Vec<MeshEvent> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();
    loop {
        match timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => out.push(event),
            Ok(None) | Err(_) => break,
        }
    }
    out
}

fn message_payloads(events: &[MeshEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|event| match event {
            MeshEvent::MeshMessage { frame, .. } => Some(frame.clone()),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[MeshEvent]) -> Vec<(DeliveryStatus, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            MeshEvent::MessageStatus {
                status, attempts, ..
            } => Some((*status, *attempts)),
            _ => None,
        })
        .collect()
}

fn timeouts(events: &[MeshEvent]) -> Vec<DeviceId> {
    events
        .iter()
        .filter_map(|event| match event {
            MeshEvent::PeerTimeout { device_id } => Some(device_id.clone()),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Test: keepalive keeps responsive peers alive
// =============================================================================

#[tokio::test(start_paused = true)]
async fn responsive_peers_survive_well_past_the_timeout_window() {
    let (node_a, mut events_a) = MeshNode::spawn("a");
    let (node_b, mut events_b) = MeshNode::spawn("b");
    connect(&node_a, &node_b).await;

    // Both sides ping, pong, and stay connected across several timeout
    // windows' worth of virtual time.
    let a_events = drain_for(&mut events_a, Duration::from_secs(60)).await;
    let b_events = drain_for(&mut events_b, Duration::from_secs(1)).await;

    assert!(timeouts(&a_events).is_empty(), "a evicted its peer");
    assert!(timeouts(&b_events).is_empty(), "b evicted its peer");

    // The keepalive has been exchanging pongs, so RTT samples exist and
    // the healthy link keeps its interval at the floor.
    let stats = node_a.network_stats().await.unwrap();
    assert_eq!(stats.keepalive_interval_ms, 5000.0);
    assert_eq!(stats.packet_loss, 0.0);
}

// =============================================================================
// Test: silent peer evicted exactly once
// =============================================================================

#[tokio::test(start_paused = true)]
async fn silent_peer_is_evicted_exactly_once() {
    let (node_a, mut events_a) = MeshNode::spawn("a");

    // The remote side of this link never answers: frames vanish into an
    // undrained receiver.
    let ((a_half, _a_rx), (_b_half, _b_rx)) = MemoryLink::pair(MEMORY_LINK_CAPACITY);
    node_a
        .add_peer("b", Arc::new(a_half), true)
        .await
        .expect("add_peer failed");

    let events = drain_for(&mut events_a, Duration::from_secs(60)).await;
    let evicted = timeouts(&events);
    assert_eq!(evicted, vec![DeviceId::from("b")], "exactly one eviction");

    // The peer is gone from the registry: stats are zeroed defaults.
    let stats = node_a.network_stats().await.unwrap();
    assert_eq!(stats.keepalive_interval_ms, 0.0);
}

// =============================================================================
// Test: direct unicast with ack and status reporting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn unicast_to_direct_peer_succeeds_on_first_attempt() {
    let (node_a, mut events_a) = MeshNode::spawn("a");
    let (node_b, mut events_b) = MeshNode::spawn("b");
    connect(&node_a, &node_b).await;

    node_a
        .send_to("b", json!({"code": "X1", "isPresent": true}))
        .await
        .expect("send failed");

    let b_events = drain_for(&mut events_b, Duration::from_secs(2)).await;
    let payloads = message_payloads(&b_events);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].get("code").and_then(Value::as_str), Some("X1"));

    let a_events = drain_for(&mut events_a, Duration::from_secs(1)).await;
    assert_eq!(
        statuses(&a_events),
        vec![
            (DeliveryStatus::Pending, 1),
            (DeliveryStatus::Success, 1)
        ]
    );
}

// =============================================================================
// Test: triangle mesh, relay and dedup
// =============================================================================

#[tokio::test(start_paused = true)]
async fn triangle_broadcast_delivers_exactly_once_per_node() {
    let (node_a, _events_a) = MeshNode::spawn("a");
    let (node_b, mut events_b) = MeshNode::spawn("b");
    let (node_c, mut events_c) = MeshNode::spawn("c");
    connect(&node_a, &node_b).await;
    connect(&node_a, &node_c).await;
    connect(&node_b, &node_c).await;

    node_a
        .send(json!({"code": "TRI", "isPresent": true}))
        .await
        .expect("send failed");

    // B and C each receive the broadcast directly AND via the third edge;
    // dedup must reduce that to exactly one local delivery apiece.
    let b_events = drain_for(&mut events_b, Duration::from_secs(20)).await;
    let c_events = drain_for(&mut events_c, Duration::from_secs(1)).await;
    assert_eq!(message_payloads(&b_events).len(), 1, "b delivered once");
    assert_eq!(message_payloads(&c_events).len(), 1, "c delivered once");
}

// =============================================================================
// Test: multi-hop relay reaches a non-neighbor
// =============================================================================

#[tokio::test(start_paused = true)]
async fn line_topology_relays_to_the_far_end() {
    let (node_a, _events_a) = MeshNode::spawn("a");
    let (node_b, _events_b) = MeshNode::spawn("b");
    let (node_c, mut events_c) = MeshNode::spawn("c");
    connect(&node_a, &node_b).await;
    connect(&node_b, &node_c).await;

    // c is not a neighbor of a; only b can carry the message across.
    node_a
        .send(json!({"code": "FAR", "isPresent": false}))
        .await
        .expect("send failed");

    let c_events = drain_for(&mut events_c, Duration::from_secs(10)).await;
    let payloads = message_payloads(&c_events);
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].get("code").and_then(Value::as_str), Some("FAR"));

    // The relayed frame carries its traversal path.
    let path: Vec<String> = payloads[0]
        .get("_path")
        .and_then(Value::as_array)
        .expect("path present")
        .iter()
        .map(|v| v.as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(path, vec!["a".to_string(), "b".to_string()]);
}

// =============================================================================
// Test: retry policy exhaustion
// =============================================================================

#[tokio::test(start_paused = true)]
async fn dead_channel_exhausts_retries_and_fails_terminally() {
    let (node_a, mut events_a) = MeshNode::spawn("a");

    // Channel closed from the remote side: every send fails immediately.
    let ((a_half, _a_rx), (b_half, _b_rx)) = MemoryLink::pair(MEMORY_LINK_CAPACITY);
    node_a
        .add_peer("b", Arc::new(a_half), true)
        .await
        .expect("add_peer failed");
    b_half.close();

    node_a
        .send_with(
            json!({"code": "DOOMED"}),
            Some("b".into()),
            Some(RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1000),
                timeout: Duration::from_millis(5000),
            }),
            None,
        )
        .await
        .expect("send failed");

    let events = drain_for(&mut events_a, Duration::from_secs(12)).await;
    assert_eq!(
        statuses(&events),
        vec![
            (DeliveryStatus::Pending, 1),
            (DeliveryStatus::Pending, 2),
            (DeliveryStatus::Pending, 3),
            (DeliveryStatus::Failed, 3),
        ],
        "exactly three attempts, one terminal failure, never a fourth"
    );
}

// =============================================================================
// Test: unreachable destination with no mesh at all
// =============================================================================

#[tokio::test(start_paused = true)]
async fn destination_with_no_route_fails_fast() {
    let (node_a, mut events_a) = MeshNode::spawn("a");

    node_a
        .send_to("nowhere", json!({"code": "LOST"}))
        .await
        .expect("send failed");

    let events = drain_for(&mut events_a, Duration::from_secs(2)).await;
    let reported = statuses(&events);
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, DeliveryStatus::Failed);
}

// =============================================================================
// Test: topology discovery across announcements
// =============================================================================

#[tokio::test(start_paused = true)]
async fn announcements_build_the_remote_view_including_second_hop_nodes() {
    let mesh = MeshConfig {
        optimization_interval: Duration::from_secs(2),
        ..MeshConfig::default()
    };
    let (node_a, _events_a) =
        MeshNode::spawn_with_config("a", HealthConfig::default(), mesh.clone());
    let (node_b, _events_b) =
        MeshNode::spawn_with_config("b", HealthConfig::default(), mesh.clone());
    let (node_c, _events_c) = MeshNode::spawn_with_config("c", HealthConfig::default(), mesh);
    connect(&node_a, &node_b).await;
    connect(&node_b, &node_c).await;

    // Let a few announcement rounds flow.
    tokio::time::sleep(Duration::from_secs(7)).await;

    let snapshot = node_a.topology().await.unwrap();
    assert_eq!(snapshot.local_device_id.as_str(), "a");
    assert_eq!(snapshot.direct_peers, vec![DeviceId::from("b")]);

    // b was discovered through its announcements and reports the b-c edge.
    let b = snapshot
        .nodes
        .iter()
        .find(|n| n.device_id.as_str() == "b")
        .expect("b in snapshot");
    assert!(b.network_strength.is_some());
    assert!(b.connected_peers.contains(&DeviceId::from("c")));

    // c is referenced by b's report but never announced to a directly:
    // present as a vertex with no metrics.
    let c = snapshot
        .nodes
        .iter()
        .find(|n| n.device_id.as_str() == "c")
        .expect("c in snapshot");
    assert!(c.network_strength.is_none());

    // The graph a-b-c puts c two hops out.
    let health = node_a.mesh_health().await.unwrap();
    assert!(health.avg_hop_count > 1.0);
}

// =============================================================================
// Test: mesh reconfiguration takes effect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn configure_mesh_rearms_the_broadcast_cadence() {
    let (node_a, mut events_a) = MeshNode::spawn("a");

    // Default cadence: one startup snapshot plus two in 70 virtual seconds.
    let before = drain_for(&mut events_a, Duration::from_secs(70)).await;
    let discovery_before = before
        .iter()
        .filter(|e| matches!(e, MeshEvent::MeshDiscovery { .. }))
        .count();

    node_a
        .configure_mesh(MeshConfig {
            optimization_interval: Duration::from_secs(1),
            ..MeshConfig::default()
        })
        .await
        .unwrap();

    let after = drain_for(&mut events_a, Duration::from_secs(70)).await;
    let discovery_after = after
        .iter()
        .filter(|e| matches!(e, MeshEvent::MeshDiscovery { .. }))
        .count();

    assert!(
        discovery_after > discovery_before * 5,
        "tighter interval must broadcast far more often ({} vs {})",
        discovery_after,
        discovery_before
    );
}
