//! # Peer Registry
//!
//! Authoritative owner of the set of directly connected peers and their
//! per-link health state. Every other component reads and mutates peers
//! only through the registry's operations; nobody else holds the channel.
//!
//! Invariant: a peer exists here iff it holds an open channel handle, and
//! removal always closes that handle.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::frames::DeviceId;
use crate::transport::FrameSink;

/// Sliding-window size for per-peer RTT samples (oldest evicted first).
pub const RTT_WINDOW: usize = 10;

/// One directly connected peer and its link health state.
pub struct Peer {
    pub device_id: DeviceId,
    channel: Arc<dyn FrameSink>,
    pub is_initiator: bool,
    /// When we last sent a keepalive probe to this peer.
    pub last_ping_sent_at: Option<Instant>,
    /// When we last saw a pong from this peer.
    pub last_pong_received_at: Option<Instant>,
    /// When we last heard anything from this peer (ping, pong, or data).
    /// This is the liveness basis for the timeout sweep.
    pub last_heard_from: Instant,
    /// Up to [`RTT_WINDOW`] most recent round-trip samples, milliseconds.
    pub rtt_history: VecDeque<u64>,
    pub packet_loss_count: u64,
    pub sample_count: u64,
    /// Current adaptive keepalive interval, clamped by the health monitor.
    pub keepalive_interval: Duration,
    /// True between sending a ping and seeing a pong; a new ping sent while
    /// still set records one lost sample.
    pub awaiting_pong: bool,
}

impl Peer {
    fn new(
        device_id: DeviceId,
        channel: Arc<dyn FrameSink>,
        is_initiator: bool,
        initial_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            device_id,
            channel,
            is_initiator,
            last_ping_sent_at: None,
            last_pong_received_at: None,
            last_heard_from: now,
            rtt_history: VecDeque::with_capacity(RTT_WINDOW),
            packet_loss_count: 0,
            sample_count: 0,
            keepalive_interval: initial_interval,
            awaiting_pong: false,
        }
    }

    pub fn channel(&self) -> &Arc<dyn FrameSink> {
        &self.channel
    }

    /// Record one RTT sample, evicting the oldest past the window.
    pub fn record_rtt(&mut self, rtt_ms: u64) {
        if self.rtt_history.len() >= RTT_WINDOW {
            self.rtt_history.pop_front();
        }
        self.rtt_history.push_back(rtt_ms);
    }

    /// Mean of the RTT window, or `None` with no samples yet.
    pub fn avg_rtt_ms(&self) -> Option<f64> {
        if self.rtt_history.is_empty() {
            return None;
        }
        let sum: u64 = self.rtt_history.iter().sum();
        Some(sum as f64 / self.rtt_history.len() as f64)
    }

    /// Lost samples over total samples; 0 before any sample.
    pub fn loss_rate(&self) -> f64 {
        if self.sample_count == 0 {
            return 0.0;
        }
        self.packet_loss_count as f64 / self.sample_count as f64
    }

    pub fn note_heard_from(&mut self, now: Instant) {
        self.last_heard_from = now;
    }

    /// A data-frame send failed at the transport: counts one sample and one
    /// loss (pings account for their sample at send time instead).
    pub fn note_send_failure(&mut self) {
        self.sample_count += 1;
        self.packet_loss_count += 1;
    }
}

/// Why a registry operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// `add_peer` for a device id already registered; registry unchanged.
    DuplicatePeer(DeviceId),
    /// Operation referenced a device id not in the registry.
    UnknownPeer(DeviceId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicatePeer(id) => write!(f, "peer `{}` is already registered", id),
            Self::UnknownPeer(id) => write!(f, "peer `{}` is not registered", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Link metrics averaged across all connected peers.
/// All fields are zero when no peers are connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct NetworkStats {
    pub average_latency_ms: f64,
    pub packet_loss: f64,
    pub keepalive_interval_ms: f64,
}

/// The authoritative peer map.
pub struct PeerRegistry {
    peers: HashMap<DeviceId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Register a peer with its open channel.
    ///
    /// Fails with [`RegistryError::DuplicatePeer`] if the id is taken; the
    /// caller keeps the channel in that case and the registry is unchanged.
    pub fn add_peer(
        &mut self,
        device_id: DeviceId,
        channel: Arc<dyn FrameSink>,
        is_initiator: bool,
        initial_interval: Duration,
        now: Instant,
    ) -> Result<(), RegistryError> {
        if self.peers.contains_key(&device_id) {
            return Err(RegistryError::DuplicatePeer(device_id));
        }
        debug!(peer = %device_id, is_initiator, "peer registered");
        self.peers.insert(
            device_id.clone(),
            Peer::new(device_id, channel, is_initiator, initial_interval, now),
        );
        Ok(())
    }

    /// Remove a peer and close its channel. Idempotent: absent ids are a
    /// no-op. Returns the removed peer for the caller to inspect.
    pub fn remove_peer(&mut self, device_id: &DeviceId) -> Option<Peer> {
        let peer = self.peers.remove(device_id)?;
        peer.channel.close();
        debug!(peer = %device_id, "peer removed, channel released");
        Some(peer)
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&Peer> {
        self.peers.get(device_id)
    }

    pub fn get_mut(&mut self, device_id: &DeviceId) -> Option<&mut Peer> {
        self.peers.get_mut(device_id)
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.peers.contains_key(device_id)
    }

    /// Snapshot of the current peer ids. Copied out so callers can keep
    /// iterating while peers are added or evicted underneath them.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.peers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Link metrics averaged across connected peers, zeroed when none.
    pub fn network_stats(&self) -> NetworkStats {
        if self.peers.is_empty() {
            return NetworkStats::default();
        }
        let count = self.peers.len() as f64;
        let mut latency = 0.0;
        let mut loss = 0.0;
        let mut interval = 0.0;
        for peer in self.peers.values() {
            latency += peer.avg_rtt_ms().unwrap_or(0.0);
            loss += peer.loss_rate();
            interval += peer.keepalive_interval.as_millis() as f64;
        }
        NetworkStats {
            average_latency_ms: latency / count,
            packet_loss: loss / count,
            keepalive_interval_ms: interval / count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryLink;

    fn test_channel() -> Arc<dyn FrameSink> {
        let ((link, _rx), _other) = MemoryLink::pair(4);
        Arc::new(link)
    }

    const INTERVAL: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn duplicate_add_is_rejected_and_registry_unchanged() {
        let mut registry = PeerRegistry::new();
        let now = Instant::now();
        registry
            .add_peer("a".into(), test_channel(), true, INTERVAL, now)
            .unwrap();

        let err = registry
            .add_peer("a".into(), test_channel(), false, INTERVAL, now)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicatePeer("a".into()));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&"a".into()).unwrap().is_initiator);
    }

    #[tokio::test]
    async fn remove_closes_the_channel_and_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let ((link, _rx), _other) = MemoryLink::pair(4);
        let channel: Arc<dyn FrameSink> = Arc::new(link);
        registry
            .add_peer("a".into(), channel.clone(), false, INTERVAL, Instant::now())
            .unwrap();

        assert!(registry.remove_peer(&"a".into()).is_some());
        assert!(!channel.is_open());
        // Second removal is a no-op.
        assert!(registry.remove_peer(&"a".into()).is_none());
    }

    #[tokio::test]
    async fn rtt_window_is_bounded_fifo() {
        let mut registry = PeerRegistry::new();
        registry
            .add_peer("a".into(), test_channel(), false, INTERVAL, Instant::now())
            .unwrap();
        let peer = registry.get_mut(&"a".into()).unwrap();

        for rtt in 0..15u64 {
            peer.record_rtt(rtt);
        }
        assert_eq!(peer.rtt_history.len(), RTT_WINDOW);
        // Oldest five evicted: window holds samples 5..=14.
        assert_eq!(peer.rtt_history.front(), Some(&5));
        assert_eq!(peer.rtt_history.back(), Some(&14));
    }

    #[tokio::test]
    async fn loss_rate_is_zero_without_samples() {
        let mut registry = PeerRegistry::new();
        registry
            .add_peer("a".into(), test_channel(), false, INTERVAL, Instant::now())
            .unwrap();
        let peer = registry.get_mut(&"a".into()).unwrap();
        assert_eq!(peer.loss_rate(), 0.0);

        peer.note_send_failure();
        assert_eq!(peer.loss_rate(), 1.0);
    }

    #[tokio::test]
    async fn stats_are_zeroed_with_no_peers_and_averaged_otherwise() {
        let mut registry = PeerRegistry::new();
        assert_eq!(registry.network_stats(), NetworkStats::default());

        let now = Instant::now();
        registry
            .add_peer("a".into(), test_channel(), false, INTERVAL, now)
            .unwrap();
        registry
            .add_peer("b".into(), test_channel(), false, Duration::from_secs(15), now)
            .unwrap();
        registry.get_mut(&"a".into()).unwrap().record_rtt(100);
        registry.get_mut(&"b".into()).unwrap().record_rtt(300);

        let stats = registry.network_stats();
        assert_eq!(stats.average_latency_ms, 200.0);
        assert_eq!(stats.keepalive_interval_ms, 10_000.0);
    }
}
