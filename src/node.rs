//! # High-Level Mesh Node API
//!
//! This module provides the main entry point for using meshkit. A
//! [`MeshNode`] combines all the underlying components (registry, health
//! monitor, topology tracker, router) into a single unified interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! let (node, mut events) = MeshNode::spawn("device-a");
//!
//! // The transport-bootstrap layer hands over an open channel per peer
//! node.add_peer("device-b", channel, true).await?;
//!
//! // Inbound frames from the transport are fed back in
//! node.handle_frame("device-b", frame_bytes).await?;
//!
//! // Fire-and-forget send; completion arrives as MessageStatus events
//! let id = node.send(serde_json::json!({"code": "X1"})).await?;
//! while let Some(event) = events.recv().await {
//!     println!("mesh event: {:?}", event);
//! }
//! ```
//!
//! ## Concurrency Model
//!
//! The handle is cheap to clone and communicates with a private actor over
//! an async channel. The actor owns ALL mutable core state and processes
//! commands sequentially, multiplexed with three tick cadences:
//!
//! | Cadence | Work |
//! |---------|------|
//! | keepalive sweep (min interval) | due pings, timeout eviction |
//! | optimization interval (configurable) | topology broadcast + health |
//! | dispatch interval (200ms) | priority queue pump, ack/retry sweep |
//!
//! Inbound frame handling arrives as commands on the same channel, so ping
//! sends, pong receipt, and timeout sweeps never race.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::events::{EventSink, MeshEvent};
use crate::frames::{epoch_ms, DeviceId, Frame, MessageId};
use crate::health::{HealthConfig, HealthMonitor};
use crate::registry::{NetworkStats, PeerRegistry, RegistryError};
use crate::router::{
    InboundAction, MessageRouter, Priority, RetryPolicy, DISPATCH_INTERVAL,
};
use crate::topology::{MeshConfig, MeshHealthReport, TopologySnapshot, TopologyTracker};
use crate::transport::{FrameSink, TransportError};

/// Capacity of the handle-to-actor command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 1000;

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    AddPeer {
        device_id: DeviceId,
        channel: Arc<dyn FrameSink>,
        is_initiator: bool,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    RemovePeer {
        device_id: DeviceId,
        reply: oneshot::Sender<bool>,
    },
    /// An inbound frame from the transport. Fire-and-forget: the transport
    /// callback must never block on the core.
    HandleFrame { from: DeviceId, bytes: Vec<u8> },
    Send {
        body: serde_json::Map<String, Value>,
        destination: Option<DeviceId>,
        policy: Option<RetryPolicy>,
        priority: Option<Priority>,
        reply: oneshot::Sender<MessageId>,
    },
    ConfigureMesh {
        config: MeshConfig,
        reply: oneshot::Sender<()>,
    },
    NetworkStats {
        reply: oneshot::Sender<NetworkStats>,
    },
    Topology {
        reply: oneshot::Sender<TopologySnapshot>,
    },
    MeshHealth {
        reply: oneshot::Sender<MeshHealthReport>,
    },
    Quit,
}

// ============================================================================
// MeshNode Handle (public API - cheap to clone)
// ============================================================================

/// Handle to a running mesh engine.
#[derive(Clone)]
pub struct MeshNode {
    local: DeviceId,
    cmd_tx: mpsc::Sender<Command>,
}

impl MeshNode {
    /// Spawn an engine with default health and mesh tuning. Returns the
    /// handle and the host event stream.
    pub fn spawn(device_id: impl Into<DeviceId>) -> (Self, mpsc::Receiver<MeshEvent>) {
        Self::spawn_with_config(device_id, HealthConfig::default(), MeshConfig::default())
    }

    /// Spawn with explicit tuning. Tests shrink the intervals here instead
    /// of waiting out real wall-clock windows.
    pub fn spawn_with_config(
        device_id: impl Into<DeviceId>,
        health: HealthConfig,
        mesh: MeshConfig,
    ) -> (Self, mpsc::Receiver<MeshEvent>) {
        let local: DeviceId = device_id.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, event_rx) = EventSink::new();

        let actor = MeshActor {
            local: local.clone(),
            registry: PeerRegistry::new(),
            health: HealthMonitor::new(health),
            topology: TopologyTracker::new(local.clone(), mesh),
            router: MessageRouter::new(local.clone()),
            events,
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { local, cmd_tx }, event_rx)
    }

    /// The local device id this engine identifies as.
    pub fn device_id(&self) -> &DeviceId {
        &self.local
    }

    /// Register a peer with its open channel, as handed over by the
    /// transport-bootstrap layer.
    pub async fn add_peer(
        &self,
        device_id: impl Into<DeviceId>,
        channel: Arc<dyn FrameSink>,
        is_initiator: bool,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddPeer {
                device_id: device_id.into(),
                channel,
                is_initiator,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))??;
        Ok(())
    }

    /// Disconnect a peer explicitly. Idempotent; returns whether the peer
    /// was present.
    pub async fn remove_peer(&self, device_id: impl Into<DeviceId>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RemovePeer {
                device_id: device_id.into(),
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("mesh engine closed"))
    }

    /// Feed one inbound frame from the transport. Malformed frames are
    /// dropped inside the engine; this only fails when the engine is gone.
    pub async fn handle_frame(
        &self,
        from: impl Into<DeviceId>,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.cmd_tx
            .send(Command::HandleFrame {
                from: from.into(),
                bytes,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))
    }

    /// Broadcast an application payload into the mesh with default retry
    /// policy and priority. Returns immediately with the message id;
    /// delivery progress arrives as `MessageStatus` events.
    pub async fn send(&self, body: Value) -> Result<MessageId> {
        self.send_with(body, None, None, None).await
    }

    /// Send an application payload toward one destination, relaying if it
    /// is not directly connected.
    pub async fn send_to(
        &self,
        destination: impl Into<DeviceId>,
        body: Value,
    ) -> Result<MessageId> {
        self.send_with(body, Some(destination.into()), None, None)
            .await
    }

    /// Full-control submission: optional destination, retry policy, and
    /// priority.
    pub async fn send_with(
        &self,
        body: Value,
        destination: Option<DeviceId>,
        policy: Option<RetryPolicy>,
        priority: Option<Priority>,
    ) -> Result<MessageId> {
        let body = match body {
            Value::Object(map) => map,
            _ => anyhow::bail!("message payload must be a JSON object"),
        };
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                body,
                destination,
                policy,
                priority,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("mesh engine closed"))
    }

    /// Replace the mesh tuning parameters. Takes effect on the next
    /// scheduling tick.
    pub async fn configure_mesh(&self, config: MeshConfig) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ConfigureMesh { config, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("mesh engine closed"))
    }

    /// Link metrics averaged across connected peers; zeroed when none.
    pub async fn network_stats(&self) -> Result<NetworkStats> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::NetworkStats { reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("mesh engine closed"))
    }

    /// The mesh as currently seen from this node.
    pub async fn topology(&self) -> Result<TopologySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Topology { reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("mesh engine closed"))
    }

    /// Aggregate mesh health metrics, computed on demand.
    pub async fn mesh_health(&self) -> Result<MeshHealthReport> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::MeshHealth { reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("mesh engine closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("mesh engine closed"))
    }

    /// Stop the engine. Peers' channels are closed when the actor drops
    /// the registry.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// MeshActor (owns state)
// ============================================================================

struct MeshActor {
    local: DeviceId,
    registry: PeerRegistry,
    health: HealthMonitor,
    topology: TopologyTracker,
    router: MessageRouter,
    events: EventSink,
}

impl MeshActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        debug!(device = %self.local, "mesh actor started");
        let mut keepalive = safe_interval(self.health.sweep_interval());
        let mut optimize = safe_interval(self.topology.config().optimization_interval);
        let mut dispatch = safe_interval(DISPATCH_INTERVAL);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::AddPeer { device_id, channel, is_initiator, reply }) => {
                            let result = self.registry.add_peer(
                                device_id.clone(),
                                channel,
                                is_initiator,
                                self.health.config().min_interval,
                                Instant::now(),
                            );
                            if result.is_ok() {
                                self.events.emit(MeshEvent::PeerConnected {
                                    device_id,
                                    is_initiator,
                                });
                            }
                            let _ = reply.send(result);
                        }
                        Some(Command::RemovePeer { device_id, reply }) => {
                            let removed = self.registry.remove_peer(&device_id).is_some();
                            if removed {
                                self.router.peer_evicted(&device_id, Instant::now(), &self.events);
                            }
                            let _ = reply.send(removed);
                        }
                        Some(Command::HandleFrame { from, bytes }) => {
                            self.handle_frame(&from, &bytes).await;
                        }
                        Some(Command::Send { body, destination, policy, priority, reply }) => {
                            let id = self.router.submit(body, destination, policy, priority);
                            let _ = reply.send(id);
                            // First attempt goes out immediately, still in
                            // priority order with anything else queued.
                            self.dispatch_pass().await;
                        }
                        Some(Command::ConfigureMesh { config, reply }) => {
                            let rearm = config.optimization_interval
                                != self.topology.config().optimization_interval;
                            self.topology.apply_config(config);
                            if rearm {
                                optimize = safe_interval(self.topology.config().optimization_interval);
                            }
                            let _ = reply.send(());
                        }
                        Some(Command::NetworkStats { reply }) => {
                            let _ = reply.send(self.registry.network_stats());
                        }
                        Some(Command::Topology { reply }) => {
                            let _ = reply.send(self.topology.snapshot(&self.registry, Instant::now()));
                        }
                        Some(Command::MeshHealth { reply }) => {
                            let _ = reply.send(self.topology.mesh_health(&self.registry));
                        }
                        Some(Command::Quit) => {
                            debug!("mesh actor quitting");
                            break;
                        }
                        None => {
                            debug!("mesh handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    self.keepalive_sweep().await;
                }
                _ = optimize.tick() => {
                    self.optimize_pass().await;
                }
                _ = dispatch.tick() => {
                    self.dispatch_pass().await;
                }
            }
        }

        // Release every channel on the way out.
        for id in self.registry.device_ids() {
            self.registry.remove_peer(&id);
        }
    }

    /// Classify one inbound frame and hand it to the owning component.
    async fn handle_frame(&mut self, from: &DeviceId, bytes: &[u8]) {
        let frame = match Frame::parse(bytes) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(peer = %from, error = %error, "malformed frame dropped");
                return;
            }
        };
        let now = Instant::now();
        if let Some(peer) = self.registry.get_mut(from) {
            peer.note_heard_from(now);
        }

        match frame {
            Frame::Ping(ping) => {
                let Some(peer) = self.registry.get(from) else {
                    trace!(peer = %from, "ping from unknown peer dropped");
                    return;
                };
                let pong = HealthMonitor::pong_for(&ping, epoch_ms()).to_bytes();
                let channel = peer.channel().clone();
                if let Err(error) = channel.send(&pong).await {
                    debug!(peer = %from, error = %error, "pong send failed");
                }
            }
            Frame::Pong(pong) => {
                match self.health.record_pong(&mut self.registry, from, &pong, now) {
                    Some(rtt_ms) => trace!(peer = %from, rtt_ms, "pong received"),
                    None => trace!(peer = %from, "pong from unknown peer dropped"),
                }
            }
            Frame::Announcement(announcement) => {
                self.topology.observe_announcement(from, &announcement, now);
            }
            Frame::Ack(ack) => {
                self.router.handle_ack(from, &ack, &self.events);
            }
            Frame::Application(app) => {
                let value = app.to_value();
                match self.router.handle_inbound(from, app, epoch_ms()) {
                    InboundAction::Duplicate => {}
                    InboundAction::Deliver { ack } => {
                        self.events.emit(MeshEvent::MeshMessage {
                            from: from.clone(),
                            frame: value,
                        });
                        if let Some(peer) = self.registry.get(from) {
                            let channel = peer.channel().clone();
                            if let Err(error) = channel.send(&ack.to_bytes()).await {
                                debug!(peer = %from, error = %error, "ack send failed");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Keepalive tick: probe due peers, then evict the silent ones.
    async fn keepalive_sweep(&mut self) {
        let now = Instant::now();
        let pings = self
            .health
            .collect_due_pings(&mut self.registry, now, epoch_ms());
        for (id, frame) in pings {
            let Some(peer) = self.registry.get(&id) else {
                continue;
            };
            let channel = peer.channel().clone();
            if let Err(error) = channel.send(&frame.to_bytes()).await {
                debug!(peer = %id, error = %error, "ping send failed");
                self.health.note_ping_send_failed(&mut self.registry, &id);
            }
        }

        for id in self.health.timed_out_peers(&self.registry, now) {
            warn!(peer = %id, "peer timed out, evicting");
            self.registry.remove_peer(&id);
            self.router.peer_evicted(&id, now, &self.events);
            self.events.emit(MeshEvent::PeerTimeout { device_id: id });
        }
    }

    /// Optimization tick: broadcast our announcement, then report shape
    /// and health to the host.
    async fn optimize_pass(&mut self) {
        let now = Instant::now();
        let announcement = self.topology.announcement(&self.registry, now, epoch_ms());
        let bytes = Frame::Announcement(announcement).to_bytes();
        for id in self.registry.device_ids() {
            let Some(peer) = self.registry.get(&id) else {
                continue;
            };
            let channel = peer.channel().clone();
            if let Err(error) = channel.send(&bytes).await {
                debug!(peer = %id, error = %error, "announcement send failed");
                if let Some(peer) = self.registry.get_mut(&id) {
                    peer.note_send_failure();
                }
            }
        }

        self.events.emit(MeshEvent::MeshDiscovery {
            snapshot: self.topology.snapshot(&self.registry, now),
        });
        self.events
            .emit(MeshEvent::mesh_health(self.topology.mesh_health(&self.registry)));
    }

    /// Dispatch tick: expire overdue acks, then pump the priority queue.
    async fn dispatch_pass(&mut self) {
        let now = Instant::now();
        self.router.sweep(now, &self.events);
        let actions = self
            .router
            .dispatch_due(&self.registry, &self.topology, now, &self.events);
        for action in actions {
            let Some(peer) = self.registry.get(&action.to) else {
                self.router.note_send_failure(
                    &action.message_id,
                    &action.to,
                    &TransportError::ChannelClosed,
                    now,
                    &self.events,
                );
                continue;
            };
            let channel = peer.channel().clone();
            if let Err(error) = channel.send(&action.bytes).await {
                if let Some(peer) = self.registry.get_mut(&action.to) {
                    peer.note_send_failure();
                }
                self.router.note_send_failure(
                    &action.message_id,
                    &action.to,
                    &error,
                    now,
                    &self.events,
                );
            }
        }
    }
}

/// Interval with a sane floor; host-supplied periods are never trusted to
/// be nonzero.
fn safe_interval(period: Duration) -> time::Interval {
    time::interval(period.max(Duration::from_millis(10)))
}
