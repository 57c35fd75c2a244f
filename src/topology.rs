//! # Mesh Topology Tracking
//!
//! Answers "what does the mesh look like from here" and propagates that
//! view. The tracker owns one [`TopologyEntry`] per discovered peer, with a
//! lifecycle independent of the direct connection it was learned through: a
//! node may be discovered without being connected, and an entry survives
//! the eviction of its peer until it goes stale.
//!
//! Every optimization tick the engine broadcasts a `meshAnnouncement` frame
//! to its direct peers and emits a discovery snapshot plus health metrics
//! to the host. The tracker never alters connections; it only reports
//! shape. The redundancy and load-balancing knobs it carries are consumed
//! by the router's relay selection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::frames::{DeviceId, MeshAnnouncement};
use crate::registry::PeerRegistry;

/// Entries not refreshed within this window are stale: excluded from
/// healthy counts but kept so host-side history stays stable.
pub const TOPOLOGY_STALE_AFTER: Duration = Duration::from_secs(30);

/// Hop bound for graph traversal and message relaying.
pub const MAX_HOPS: usize = 5;

/// Default cadence of topology broadcasts.
pub const DEFAULT_OPTIMIZATION_INTERVAL: Duration = Duration::from_secs(30);

/// Default relay fan-out for messages without a direct route.
pub const DEFAULT_TARGET_REDUNDANCY: usize = 2;

/// Normalization bound for strength math: how many tracked neighbors count
/// as a "full" mesh.
const MAX_TRACKED_PEERS: usize = 10;

/// Host-supplied mesh tuning. Replaced wholesale by `configure_mesh`;
/// takes effect on the next scheduling tick.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub optimization_interval: Duration,
    pub target_redundancy: usize,
    pub load_balancing: bool,
    pub adaptive_routing: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            optimization_interval: DEFAULT_OPTIMIZATION_INTERVAL,
            target_redundancy: DEFAULT_TARGET_REDUNDANCY,
            load_balancing: true,
            adaptive_routing: true,
        }
    }
}

/// What we know about one discovered peer.
#[derive(Debug, Clone)]
pub struct TopologyEntry {
    pub device_id: DeviceId,
    pub network_strength: f64,
    pub connection_count: usize,
    pub last_seen: Instant,
    /// Peers this node reports being linked to. Never contains the local
    /// device id; that edge is implicit.
    pub connected_peers: HashSet<DeviceId>,
}

impl TopologyEntry {
    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) > TOPOLOGY_STALE_AFTER
    }
}

/// One vertex in a topology snapshot. Metrics are `None` for nodes that
/// are only referenced by a neighbor's report and not yet discovered
/// themselves.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    pub device_id: DeviceId,
    pub network_strength: Option<f64>,
    pub connection_count: Option<usize>,
    pub stale: bool,
    pub connected_peers: Vec<DeviceId>,
}

/// Point-in-time view of the mesh as seen from the local node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySnapshot {
    pub local_device_id: DeviceId,
    pub direct_peers: Vec<DeviceId>,
    pub nodes: Vec<SnapshotNode>,
}

/// Aggregate mesh health metrics for the `meshHealth` event.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshHealthReport {
    pub redundancy: f64,
    pub avg_hop_count: f64,
    pub stability: f64,
}

/// Owner of the discovered-mesh graph.
pub struct TopologyTracker {
    local: DeviceId,
    entries: HashMap<DeviceId, TopologyEntry>,
    config: MeshConfig,
}

impl TopologyTracker {
    pub fn new(local: DeviceId, config: MeshConfig) -> Self {
        Self {
            local,
            entries: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Replace the active tuning parameters.
    pub fn apply_config(&mut self, config: MeshConfig) {
        debug!(
            interval_ms = config.optimization_interval.as_millis() as u64,
            target_redundancy = config.target_redundancy,
            load_balancing = config.load_balancing,
            adaptive_routing = config.adaptive_routing,
            "mesh configuration applied"
        );
        self.config = config;
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&TopologyEntry> {
        self.entries.get(device_id)
    }

    /// Upsert the entry for an announcing peer. The reported neighbor set
    /// replaces the previous one; the local id is stripped (the edge to us
    /// is implicit) and so is any self-loop.
    pub fn observe_announcement(
        &mut self,
        from: &DeviceId,
        announcement: &MeshAnnouncement,
        now: Instant,
    ) {
        let connected: HashSet<DeviceId> = announcement
            .connected_peers
            .iter()
            .filter(|id| *id != &self.local && *id != from)
            .cloned()
            .collect();

        let entry = self
            .entries
            .entry(from.clone())
            .or_insert_with(|| TopologyEntry {
                device_id: from.clone(),
                network_strength: 0.0,
                connection_count: 0,
                last_seen: now,
                connected_peers: HashSet::new(),
            });
        entry.network_strength = announcement.network_strength.clamp(0.0, 1.0);
        entry.connection_count = announcement.connection_count;
        entry.last_seen = now;
        entry.connected_peers = connected;
    }

    /// The announcement this node broadcasts on its optimization tick.
    pub fn announcement(
        &self,
        registry: &PeerRegistry,
        now: Instant,
        now_ms: u64,
    ) -> MeshAnnouncement {
        let mut connected = registry.device_ids();
        connected.sort();
        MeshAnnouncement {
            device_id: self.local.clone(),
            timestamp: now_ms,
            connection_count: connected.len(),
            network_strength: self.network_strength(now),
            connected_peers: connected,
        }
    }

    /// Blend of neighbor connectivity and their reported strengths, 0..1.
    /// Stale entries do not contribute.
    pub fn network_strength(&self, now: Instant) -> f64 {
        let healthy: Vec<&TopologyEntry> = self
            .entries
            .values()
            .filter(|entry| !entry.is_stale(now))
            .collect();
        if healthy.is_empty() {
            return 0.0;
        }
        let total: f64 = healthy
            .iter()
            .map(|entry| {
                let connectivity = entry.connection_count as f64 / MAX_TRACKED_PEERS as f64;
                connectivity * 0.5 + entry.network_strength * 0.5
            })
            .sum();
        (total / MAX_TRACKED_PEERS as f64).min(1.0)
    }

    /// Build the snapshot broadcast to the host: the local node, its direct
    /// peers, every discovered entry with its reported edges, and any node
    /// referenced by a report but not yet discovered (as a metric-less
    /// vertex).
    pub fn snapshot(&self, registry: &PeerRegistry, now: Instant) -> TopologySnapshot {
        let mut direct = registry.device_ids();
        direct.sort();

        let mut ids: HashSet<DeviceId> = HashSet::new();
        ids.extend(direct.iter().cloned());
        for entry in self.entries.values() {
            ids.insert(entry.device_id.clone());
            ids.extend(entry.connected_peers.iter().cloned());
        }
        ids.remove(&self.local);

        let mut nodes: Vec<SnapshotNode> = ids
            .into_iter()
            .map(|id| match self.entries.get(&id) {
                Some(entry) => {
                    let mut connected: Vec<DeviceId> =
                        entry.connected_peers.iter().cloned().collect();
                    connected.sort();
                    SnapshotNode {
                        device_id: id,
                        network_strength: Some(entry.network_strength),
                        connection_count: Some(entry.connection_count),
                        stale: entry.is_stale(now),
                        connected_peers: connected,
                    }
                }
                None => SnapshotNode {
                    device_id: id,
                    network_strength: None,
                    connection_count: None,
                    stale: false,
                    connected_peers: Vec::new(),
                },
            })
            .collect();
        nodes.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        TopologySnapshot {
            local_device_id: self.local.clone(),
            direct_peers: direct,
            nodes,
        }
    }

    /// Hops from the local node to every reachable vertex, bounded at
    /// [`MAX_HOPS`]. Breadth-first over the undirected known graph.
    pub fn hop_counts(&self, registry: &PeerRegistry) -> HashMap<DeviceId, usize> {
        let adjacency = self.adjacency(registry);
        let mut hops: HashMap<DeviceId, usize> = HashMap::new();
        hops.insert(self.local.clone(), 0);

        let mut queue: VecDeque<DeviceId> = VecDeque::new();
        queue.push_back(self.local.clone());
        while let Some(current) = queue.pop_front() {
            let current_hops = hops[&current];
            if current_hops >= MAX_HOPS {
                continue;
            }
            let Some(neighbors) = adjacency.get(&current) else {
                continue;
            };
            for neighbor in neighbors {
                if !hops.contains_key(neighbor) {
                    hops.insert(neighbor.clone(), current_hops + 1);
                    queue.push_back(neighbor.clone());
                }
            }
        }
        hops
    }

    /// Aggregate metrics for the periodic `meshHealth` event.
    pub fn mesh_health(&self, registry: &PeerRegistry) -> MeshHealthReport {
        let adjacency = self.adjacency(registry);
        if adjacency.is_empty() {
            return MeshHealthReport {
                redundancy: 0.0,
                avg_hop_count: 0.0,
                stability: 1.0,
            };
        }

        let node_count = adjacency.len() as f64;
        let total_degree: usize = adjacency.values().map(HashSet::len).sum();
        let redundancy = total_degree as f64 / node_count;

        let hops = self.hop_counts(registry);
        let remote_hops: Vec<usize> = hops
            .iter()
            .filter(|(id, _)| *id != &self.local)
            .map(|(_, h)| *h)
            .collect();
        let avg_hop_count = if remote_hops.is_empty() {
            0.0
        } else {
            remote_hops.iter().sum::<usize>() as f64 / remote_hops.len() as f64
        };

        // Degenerate redundancy target still yields a meaningful ratio.
        let target = self.config.target_redundancy.max(1) as f64;
        let stability = (total_degree as f64 / (node_count * target)).min(1.0);

        MeshHealthReport {
            redundancy,
            avg_hop_count,
            stability,
        }
    }

    /// Undirected adjacency over everything known: local <-> direct peers,
    /// plus every reported edge.
    fn adjacency(&self, registry: &PeerRegistry) -> HashMap<DeviceId, HashSet<DeviceId>> {
        let mut adjacency: HashMap<DeviceId, HashSet<DeviceId>> = HashMap::new();
        let mut link = |a: &DeviceId, b: &DeviceId| {
            adjacency
                .entry(a.clone())
                .or_default()
                .insert(b.clone());
            adjacency
                .entry(b.clone())
                .or_default()
                .insert(a.clone());
        };

        for id in registry.device_ids() {
            link(&self.local, &id);
        }
        for entry in self.entries.values() {
            for neighbor in &entry.connected_peers {
                link(&entry.device_id, neighbor);
            }
        }
        adjacency
    }
}
