//! # Host-Facing Events
//!
//! The engine surfaces peer lifecycle, mesh shape, and delivery outcomes
//! through a single one-way event stream. The host consumes the receiver
//! handed out by `MeshNode::spawn`; nothing ever calls back into the core.
//!
//! Emission is fire-and-forget over a bounded channel: a slow host drops
//! events (with a warning) rather than stalling sweeps or frame dispatch.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::frames::{DeviceId, MessageId};
use crate::router::DeliveryStatus;
use crate::topology::{MeshHealthReport, TopologySnapshot};

/// Capacity of the host event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the engine reports to its host.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A peer was registered with an open channel.
    PeerConnected {
        device_id: DeviceId,
        is_initiator: bool,
    },
    /// A peer went silent past the timeout window and was evicted.
    PeerTimeout { device_id: DeviceId },
    /// Periodic topology broadcast: the mesh as seen from this node.
    MeshDiscovery { snapshot: TopologySnapshot },
    /// An application frame was delivered locally.
    MeshMessage {
        from: DeviceId,
        frame: Value,
    },
    /// A tracked message changed state. Emitted on every transition, not
    /// only terminal ones, so hosts can render live progress.
    MessageStatus {
        message_id: MessageId,
        status: DeliveryStatus,
        attempts: u32,
        error: Option<String>,
    },
    /// Periodic mesh health metrics.
    MeshHealth {
        redundancy: f64,
        avg_hop_count: f64,
        stability: f64,
    },
}

impl MeshEvent {
    pub fn mesh_health(report: MeshHealthReport) -> Self {
        Self::MeshHealth {
            redundancy: report.redundancy,
            avg_hop_count: report.avg_hop_count,
            stability: report.stability,
        }
    }
}

/// Bounded, non-blocking sender side of the host event stream.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<MeshEvent>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::Receiver<MeshEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Emit an event without blocking. Overflow drops the event.
    pub fn emit(&self, event: MeshEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("event receiver dropped, event discarded");
            }
        }
    }
}
