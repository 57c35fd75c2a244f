//! # Meshkit - Peer-to-Peer Mesh Networking Engine
//!
//! Meshkit maintains a live view of which peers are reachable and how
//! healthy each link is, discovers the shape of the surrounding mesh, and
//! routes application messages to peers that may not be directly
//! connected, with bounded retries and observable delivery status.
//!
//! It layers on top of an arbitrary bidirectional, unreliable,
//! unordered-delivery transport: the bootstrap layer (ICE/SDP, NFC, QR,
//! whatever establishes the channel) hands each peer's send endpoint to
//! the engine and feeds raw inbound frames back in. Everything else is the
//! engine's job.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! - [`MeshNode`] is a cheap-to-clone handle communicating over an async
//!   channel with a private actor
//! - The actor owns all mutable state (peers, topology, in-flight
//!   messages) and processes commands sequentially
//! - Periodic work (keepalive sweeps, topology broadcasts, retry
//!   dispatch) is multiplexed onto the same actor loop, so nothing races
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `frames` | JSON wire frames and their codec |
//! | `transport` | `FrameSink` seam + in-memory reference transport |
//! | `registry` | Authoritative peer set and per-link health state |
//! | `health` | Ping/pong keepalive, RTT/loss estimation, timeouts |
//! | `topology` | Discovered-mesh graph, snapshots, health metrics |
//! | `router` | Dedup, relay fan-out, retry policy, delivery status |
//! | `events` | One-way host-facing event stream |

mod events;
mod frames;
mod health;
mod node;
mod registry;
mod router;
mod topology;
mod transport;

pub use events::{EventSink, MeshEvent, EVENT_CHANNEL_CAPACITY};
pub use frames::{
    epoch_ms, AppFrame, DeviceId, Frame, FrameError, MeshAnnouncement, MessageAck, MessageId,
    Ping, Pong, MAX_FRAME_SIZE,
};
pub use health::{
    HealthConfig, HealthMonitor, LATENCY_DEGRADE_MS, LATENCY_IMPROVE_MS, LOSS_DEGRADE,
    LOSS_IMPROVE, MAX_KEEPALIVE_INTERVAL, MIN_KEEPALIVE_INTERVAL, PEER_TIMEOUT,
};
pub use node::MeshNode;
pub use registry::{NetworkStats, Peer, PeerRegistry, RegistryError, RTT_WINDOW};
pub use router::{
    DeliveryStatus, Priority, RetryPolicy, DEDUP_CACHE_SIZE, DISPATCH_INTERVAL,
};
pub use topology::{
    MeshConfig, MeshHealthReport, SnapshotNode, TopologyEntry, TopologySnapshot,
    TopologyTracker, DEFAULT_OPTIMIZATION_INTERVAL, DEFAULT_TARGET_REDUNDANCY, MAX_HOPS,
    TOPOLOGY_STALE_AFTER,
};
pub use transport::{FrameSink, MemoryLink, TransportError, MEMORY_LINK_CAPACITY};
