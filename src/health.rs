//! # Link Health Monitoring
//!
//! Runs the ping/pong keepalive protocol over every registered peer,
//! derives RTT and packet-loss estimates, adapts each peer's probing
//! interval to the measured link quality, and detects peers that have gone
//! silent past the timeout window.
//!
//! ## Protocol
//!
//! 1. Every sweep tick (the minimum keepalive interval), peers whose last
//!    probe is older than their current per-peer interval get a
//!    `ping{timestamp}`.
//! 2. A peer answers `ping` with `pong{originalTimestamp, timestamp}`
//!    immediately on the same channel.
//! 3. RTT is the difference of the two embedded timestamps; receipt-time
//!    skew never enters the sample.
//! 4. After each sample the interval doubles on a degraded link and halves
//!    on a healthy one, clamped to `[min_interval, max_interval]`.
//!    Backing off on degraded links cuts probe overhead; tightening on
//!    healthy links detects failure faster.
//! 5. Peers silent past `peer_timeout` are reported for eviction. Silence
//!    means no inbound frame of any kind, not probe scheduling on our side.
//!
//! A single dropped ping or pong only moves the loss counter; persistent
//! silence is fatal to that peer's session only, never to the process.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::frames::{DeviceId, Frame, Ping, Pong};
use crate::registry::{Peer, PeerRegistry};

/// Floor for the adaptive keepalive interval; also the sweep granularity.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Ceiling for the adaptive keepalive interval.
pub const MAX_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A peer with no inbound activity for longer than this is evicted.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(15);

/// Average RTT above this doubles the probing interval.
pub const LATENCY_DEGRADE_MS: f64 = 1000.0;

/// Average RTT below this (with low loss) halves the probing interval.
pub const LATENCY_IMPROVE_MS: f64 = 500.0;

/// Loss rate above this doubles the probing interval.
pub const LOSS_DEGRADE: f64 = 0.10;

/// Loss rate below this (with low RTT) halves the probing interval.
pub const LOSS_IMPROVE: f64 = 0.05;

/// Tunables for the keepalive protocol. Defaults match the wire protocol's
/// documented thresholds; tests shrink them to avoid long waits.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub peer_timeout: Duration,
    pub latency_degrade_ms: f64,
    pub latency_improve_ms: f64,
    pub loss_degrade: f64,
    pub loss_improve: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            min_interval: MIN_KEEPALIVE_INTERVAL,
            max_interval: MAX_KEEPALIVE_INTERVAL,
            peer_timeout: PEER_TIMEOUT,
            latency_degrade_ms: LATENCY_DEGRADE_MS,
            latency_improve_ms: LATENCY_IMPROVE_MS,
            loss_degrade: LOSS_DEGRADE,
            loss_improve: LOSS_IMPROVE,
        }
    }
}

/// Keepalive policy over the peer registry. Holds no per-peer state of its
/// own; everything lives on [`Peer`] and is mutated through the registry.
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Sweep granularity: the minimum keepalive interval, not any one
    /// peer's current interval.
    pub fn sweep_interval(&self) -> Duration {
        self.config.min_interval
    }

    /// Collect the ping frames due this sweep.
    ///
    /// A peer is due when it has never been probed or when its own adaptive
    /// interval has elapsed since the last probe. Sending while a previous
    /// probe is still unanswered records one lost sample first. Each probe
    /// accounts for one sample.
    pub fn collect_due_pings(
        &self,
        registry: &mut PeerRegistry,
        now: Instant,
        now_ms: u64,
    ) -> Vec<(DeviceId, Frame)> {
        let mut due = Vec::new();
        for id in registry.device_ids() {
            let Some(peer) = registry.get_mut(&id) else {
                continue;
            };
            let elapsed = peer.last_ping_sent_at.map(|at| now.duration_since(at));
            let is_due = match elapsed {
                None => true,
                Some(elapsed) => elapsed >= peer.keepalive_interval,
            };
            if !is_due {
                continue;
            }
            if peer.awaiting_pong {
                peer.packet_loss_count += 1;
                trace!(peer = %id, "previous ping unanswered, counted as loss");
            }
            peer.sample_count += 1;
            peer.awaiting_pong = true;
            peer.last_ping_sent_at = Some(now);
            due.push((id, Frame::Ping(Ping { timestamp: now_ms })));
        }
        due
    }

    /// The reply owed for an inbound ping: echo its timestamp, stamp ours.
    pub fn pong_for(ping: &Ping, now_ms: u64) -> Frame {
        Frame::Pong(Pong {
            original_timestamp: ping.timestamp,
            timestamp: now_ms,
        })
    }

    /// Record a pong from `from` and re-evaluate its probing interval.
    ///
    /// RTT comes from the pong's embedded timestamps. Out-of-order pongs
    /// are tolerated: whichever ping this answers, it refreshes liveness.
    /// Returns the recorded sample for tracing, `None` for unknown peers.
    pub fn record_pong(
        &self,
        registry: &mut PeerRegistry,
        from: &DeviceId,
        pong: &Pong,
        now: Instant,
    ) -> Option<u64> {
        let peer = registry.get_mut(from)?;
        let rtt_ms = pong.timestamp.saturating_sub(pong.original_timestamp);
        peer.record_rtt(rtt_ms);
        peer.awaiting_pong = false;
        peer.last_pong_received_at = Some(now);
        peer.note_heard_from(now);
        self.adapt_interval(peer);
        Some(rtt_ms)
    }

    /// A ping send failed at the transport. The sample was already counted
    /// when the probe was collected, so this only moves the loss counter.
    pub fn note_ping_send_failed(&self, registry: &mut PeerRegistry, to: &DeviceId) {
        if let Some(peer) = registry.get_mut(to) {
            peer.packet_loss_count += 1;
            peer.awaiting_pong = false;
        }
    }

    /// Peers silent past the timeout window, due for eviction.
    pub fn timed_out_peers(&self, registry: &PeerRegistry, now: Instant) -> Vec<DeviceId> {
        registry
            .iter()
            .filter(|peer| now.duration_since(peer.last_heard_from) > self.config.peer_timeout)
            .map(|peer| peer.device_id.clone())
            .collect()
    }

    /// Degraded links back off, healthy links tighten, clamped both ways.
    fn adapt_interval(&self, peer: &mut Peer) {
        let Some(avg_rtt) = peer.avg_rtt_ms() else {
            return;
        };
        let loss = peer.loss_rate();
        let current = peer.keepalive_interval;

        let next = if avg_rtt > self.config.latency_degrade_ms || loss > self.config.loss_degrade {
            (current * 2).min(self.config.max_interval)
        } else if avg_rtt < self.config.latency_improve_ms && loss < self.config.loss_improve {
            (current / 2).max(self.config.min_interval)
        } else {
            current
        };

        if next != current {
            debug!(
                peer = %peer.device_id,
                avg_rtt_ms = avg_rtt,
                loss_rate = loss,
                from_ms = current.as_millis() as u64,
                to_ms = next.as_millis() as u64,
                "keepalive interval adapted"
            );
            peer.keepalive_interval = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::frames::DeviceId;
    use crate::transport::{FrameSink, MemoryLink};

    fn test_registry_with(ids: &[&str], monitor: &HealthMonitor) -> PeerRegistry {
        let mut registry = PeerRegistry::new();
        for id in ids {
            let ((link, _rx), _other) = MemoryLink::pair(4);
            let channel: Arc<dyn FrameSink> = Arc::new(link);
            registry
                .add_peer(
                    (*id).into(),
                    channel,
                    false,
                    monitor.config().min_interval,
                    Instant::now(),
                )
                .unwrap();
        }
        registry
    }

    fn pong(original: u64, reply: u64) -> Pong {
        Pong {
            original_timestamp: original,
            timestamp: reply,
        }
    }

    #[tokio::test]
    async fn rtt_uses_embedded_timestamps_not_receipt_time() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let mut registry = test_registry_with(&["b"], &monitor);
        let id: DeviceId = "b".into();

        // Pong echoes timestamp 1000, stamped 1050 by the responder; the
        // sample is 50ms no matter when we observe it.
        let rtt = monitor.record_pong(&mut registry, &id, &pong(1000, 1050), Instant::now());
        assert_eq!(rtt, Some(50));
        assert_eq!(registry.get(&id).unwrap().rtt_history.back(), Some(&50));
    }

    #[tokio::test]
    async fn degraded_link_doubles_interval_up_to_ceiling() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let mut registry = test_registry_with(&["b"], &monitor);
        let id: DeviceId = "b".into();
        let now = Instant::now();

        // Three samples averaging 1250ms push 5s -> 10s.
        for (original, reply) in [(0, 1200), (0, 1300), (0, 1250)] {
            monitor.record_pong(&mut registry, &id, &pong(original, reply), now);
        }
        assert_eq!(
            registry.get(&id).unwrap().keepalive_interval,
            Duration::from_secs(10)
        );

        // One more degraded sample doubles again to 20s.
        monitor.record_pong(&mut registry, &id, &pong(0, 1400), now);
        assert_eq!(
            registry.get(&id).unwrap().keepalive_interval,
            Duration::from_secs(20)
        );

        // Repeated degradation clamps at the 30s ceiling.
        for _ in 0..5 {
            monitor.record_pong(&mut registry, &id, &pong(0, 1500), now);
        }
        assert_eq!(
            registry.get(&id).unwrap().keepalive_interval,
            MAX_KEEPALIVE_INTERVAL
        );
    }

    #[tokio::test]
    async fn healthy_link_halves_interval_down_to_floor() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let mut registry = test_registry_with(&["b"], &monitor);
        let id: DeviceId = "b".into();
        let now = Instant::now();

        // Degrade first so there is room to come back down.
        for _ in 0..4 {
            monitor.record_pong(&mut registry, &id, &pong(0, 2000), now);
        }
        assert_eq!(
            registry.get(&id).unwrap().keepalive_interval,
            MAX_KEEPALIVE_INTERVAL
        );

        // Flood the window with fast samples until the average recovers,
        // then keep sampling: the interval must halve stepwise to the floor
        // and never go below it.
        for _ in 0..20 {
            monitor.record_pong(&mut registry, &id, &pong(0, 10), now);
        }
        assert_eq!(
            registry.get(&id).unwrap().keepalive_interval,
            MIN_KEEPALIVE_INTERVAL
        );
    }

    #[tokio::test]
    async fn middling_link_leaves_interval_unchanged() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let mut registry = test_registry_with(&["b"], &monitor);
        let id: DeviceId = "b".into();

        // 700ms sits between the improve (500) and degrade (1000) bars.
        monitor.record_pong(&mut registry, &id, &pong(0, 700), Instant::now());
        assert_eq!(
            registry.get(&id).unwrap().keepalive_interval,
            MIN_KEEPALIVE_INTERVAL
        );
    }

    #[tokio::test]
    async fn loss_rate_alone_degrades_the_interval() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let mut registry = test_registry_with(&["b"], &monitor);
        let id: DeviceId = "b".into();

        // Nine lost probes against one fast answer: loss rate 0.9.
        {
            let peer = registry.get_mut(&id).unwrap();
            peer.sample_count = 10;
            peer.packet_loss_count = 9;
        }
        monitor.record_pong(&mut registry, &id, &pong(0, 10), Instant::now());
        assert_eq!(
            registry.get(&id).unwrap().keepalive_interval,
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pings_are_due_per_peer_interval_and_count_losses() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let mut registry = test_registry_with(&["b"], &monitor);
        let id: DeviceId = "b".into();

        // Never pinged: due immediately.
        let due = monitor.collect_due_pings(&mut registry, Instant::now(), 1000);
        assert_eq!(due.len(), 1);
        assert_eq!(registry.get(&id).unwrap().sample_count, 1);
        assert!(registry.get(&id).unwrap().awaiting_pong);

        // Interval not yet elapsed: nothing due.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(monitor
            .collect_due_pings(&mut registry, Instant::now(), 2000)
            .is_empty());

        // Past the interval with the pong still missing: a second probe is
        // sent and the unanswered one becomes a loss.
        tokio::time::advance(Duration::from_secs(5)).await;
        let due = monitor.collect_due_pings(&mut registry, Instant::now(), 7000);
        assert_eq!(due.len(), 1);
        let peer = registry.get(&id).unwrap();
        assert_eq!(peer.sample_count, 2);
        assert_eq!(peer.packet_loss_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_reported_after_timeout() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let mut registry = test_registry_with(&["b", "c"], &monitor);
        let b: DeviceId = "b".into();
        let c: DeviceId = "c".into();

        tokio::time::advance(Duration::from_secs(10)).await;
        // c stays chatty, b stays silent.
        registry.get_mut(&c).unwrap().note_heard_from(Instant::now());
        assert!(monitor.timed_out_peers(&registry, Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let timed_out = monitor.timed_out_peers(&registry, Instant::now());
        assert_eq!(timed_out, vec![b]);
    }

    #[test]
    fn pong_reply_echoes_the_probe_timestamp() {
        let frame = HealthMonitor::pong_for(&Ping { timestamp: 1234 }, 5678);
        match frame {
            Frame::Pong(p) => {
                assert_eq!(p.original_timestamp, 1234);
                assert_eq!(p.timestamp, 5678);
            }
            other => panic!("expected pong, got {:?}", other),
        }
    }
}
