//! # Message Routing
//!
//! Delivers application messages to peers that may not be directly
//! connected, with bounded retries and observable delivery status.
//!
//! ## Flow
//!
//! 1. **Submission** enqueues a tracked message; the first attempt runs on
//!    the immediately following dispatch pass, honoring priority order.
//! 2. **Targets**: a directly connected destination gets the frame on its
//!    own channel; anything else fans out to up to `target_redundancy`
//!    neighbors not already on the message's path, healthiest link first.
//! 3. **Dedup**: every inbound frame's message id is checked against a
//!    bounded recent-ids cache; duplicates are dropped without delivery or
//!    relay, which bounds flooding in cyclic topologies.
//! 4. **Acks** are per target; retries go only to targets that have not
//!    acked yet.
//! 5. **Retry**: a failed attempt (transport error or ack timeout)
//!    schedules the next one after `backoff * attempts`; exhausting
//!    `max_attempts` is terminal.
//!
//! Delivery status events are emitted on every transition so hosts can
//! render live progress, for locally submitted messages. Relayed forwards
//! run the same retry machinery but stay silent toward the host.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::events::{EventSink, MeshEvent};
use crate::frames::{AppFrame, DeviceId, Frame, MessageAck, MessageId};
use crate::registry::PeerRegistry;
use crate::topology::{TopologyTracker, MAX_HOPS};
use crate::transport::TransportError;

/// Capacity of the recently-seen message id cache.
pub const DEDUP_CACHE_SIZE: usize = 1024;

/// Cadence of the dispatch/retry pass.
pub const DISPATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum relay forwards tracked concurrently. Inbound relays past this
/// bound are delivered locally but not forwarded further.
pub const MAX_RELAY_BACKLOG: usize = 1024;

/// Ordering hint among queued outbound sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Parse the wire label (`_priority` payload field). Unknown labels
    /// fall back to `Medium`.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_uppercase().as_str() {
            "HIGH" => Self::High,
            "LOW" => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

/// Retry tuning supplied at submission.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Delivery state of a tracked message. `Success` and `Failed` are
/// terminal; each is reported exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Where a tracked message came from. Only local submissions surface
/// status events to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Relay,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Waiting for a dispatch pass.
    Queued,
    /// Sent; acks due before the deadline.
    AwaitingAck { deadline: Instant },
    /// Attempt failed; next one resumes at this instant.
    Backoff { resume: Instant },
}

struct PendingDelivery {
    frame: AppFrame,
    destination: Option<DeviceId>,
    origin: Origin,
    priority: Priority,
    policy: RetryPolicy,
    attempts: u32,
    phase: Phase,
    /// Targets of the current fan-out still owing an ack.
    targets: HashSet<DeviceId>,
    /// Targets that have acked any round.
    acked: HashSet<DeviceId>,
    seq: u64,
    last_error: Option<String>,
}

/// One frame the dispatch pass wants written to a peer channel.
pub struct SendAction {
    pub message_id: MessageId,
    pub to: DeviceId,
    pub bytes: Vec<u8>,
}

/// Outcome of classifying an inbound application frame.
pub enum InboundAction {
    /// Already seen: no delivery, no ack, no relay.
    Duplicate,
    /// New message: deliver locally and ack the sending hop.
    Deliver { ack: Frame },
}

/// Owner of in-flight messages and the dedup window.
pub struct MessageRouter {
    local: DeviceId,
    seen: LruCache<MessageId, ()>,
    in_flight: HashMap<MessageId, PendingDelivery>,
    next_seq: u64,
}

impl MessageRouter {
    pub fn new(local: DeviceId) -> Self {
        Self {
            local,
            seen: LruCache::new(
                NonZeroUsize::new(DEDUP_CACHE_SIZE).expect("dedup cache size is nonzero"),
            ),
            in_flight: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Track a new outbound message. The caller runs a dispatch pass right
    /// after, so the first attempt is effectively immediate while still
    /// honoring priority order under load.
    pub fn submit(
        &mut self,
        body: serde_json::Map<String, serde_json::Value>,
        destination: Option<DeviceId>,
        policy: Option<RetryPolicy>,
        priority: Option<Priority>,
    ) -> MessageId {
        let message_id = MessageId::generate(&self.local);
        let frame = AppFrame {
            message_id: message_id.clone(),
            path: vec![self.local.clone()],
            body,
        };
        // Our own id goes into the dedup window so a mesh echo of this
        // message is never re-delivered locally.
        self.seen.put(message_id.clone(), ());
        self.track(frame, destination, Origin::Local, policy, priority);
        message_id
    }

    /// Classify an inbound application frame: dedup, local delivery, ack,
    /// and possibly a tracked relay forward.
    pub fn handle_inbound(
        &mut self,
        from: &DeviceId,
        frame: AppFrame,
        now_ms: u64,
    ) -> InboundAction {
        if self.seen.get(&frame.message_id).is_some() {
            trace!(message_id = %frame.message_id, "duplicate message dropped");
            return InboundAction::Duplicate;
        }
        self.seen.put(frame.message_id.clone(), ());

        let ack = Frame::Ack(MessageAck {
            message_id: frame.message_id.clone(),
            timestamp: now_ms,
        });

        // Relay onward while the traversal is within the hop budget.
        if frame.path.len() < MAX_HOPS {
            if self.relay_backlog() < MAX_RELAY_BACKLOG {
                let priority = frame
                    .body
                    .get("_priority")
                    .and_then(serde_json::Value::as_str)
                    .map(Priority::from_label)
                    .unwrap_or_default();
                let forwarded = frame.forwarded_via(&self.local);
                self.track(forwarded, None, Origin::Relay, None, Some(priority));
            } else {
                debug!(
                    message_id = %frame.message_id,
                    "relay backlog full, delivering without forwarding"
                );
            }
        }

        trace!(message_id = %frame.message_id, from = %from, "application frame delivered");
        InboundAction::Deliver { ack }
    }

    /// Record a per-hop ack. A message with no target left owing an ack is
    /// delivered: terminal success.
    pub fn handle_ack(
        &mut self,
        from: &DeviceId,
        ack: &MessageAck,
        events: &EventSink,
    ) {
        let Some(entry) = self.in_flight.get_mut(&ack.message_id) else {
            trace!(message_id = %ack.message_id, "ack for untracked message ignored");
            return;
        };
        entry.acked.insert(from.clone());
        entry.targets.remove(from);
        if entry.targets.is_empty() && matches!(entry.phase, Phase::AwaitingAck { .. }) {
            self.complete(&ack.message_id, events);
        }
    }

    /// A transport write for `message_id` to `to` failed. Once every target
    /// of the round has failed, the attempt is over and backoff starts.
    pub fn note_send_failure(
        &mut self,
        message_id: &MessageId,
        to: &DeviceId,
        error: &TransportError,
        now: Instant,
        events: &EventSink,
    ) {
        let Some(entry) = self.in_flight.get_mut(message_id) else {
            return;
        };
        entry.targets.remove(to);
        entry.last_error = Some(error.to_string());
        if entry.targets.is_empty() {
            self.retry_or_fail(message_id, now, events);
        }
    }

    /// A peer left the mesh: forget it as a pending target everywhere and
    /// re-plan any message that was waiting only on it.
    pub fn peer_evicted(&mut self, device_id: &DeviceId, now: Instant, events: &EventSink) {
        let affected: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.targets.contains(device_id))
            .map(|(id, _)| id.clone())
            .collect();
        for message_id in affected {
            let Some(entry) = self.in_flight.get_mut(&message_id) else {
                continue;
            };
            entry.targets.remove(device_id);
            entry.last_error = Some(format!("peer `{}` evicted", device_id));
            if entry.targets.is_empty() {
                self.retry_or_fail(&message_id, now, events);
            }
        }
    }

    /// Ack-deadline sweep: attempts whose deadline passed with unacked
    /// targets move to backoff or fail terminally.
    pub fn sweep(&mut self, now: Instant, events: &EventSink) {
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.phase, Phase::AwaitingAck { deadline } if deadline <= now)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for message_id in expired {
            if let Some(entry) = self.in_flight.get_mut(&message_id) {
                entry.last_error = Some("delivery timed out".to_string());
            }
            self.retry_or_fail(&message_id, now, events);
        }
    }

    /// Collect the sends due this pass: queued messages and retries whose
    /// backoff elapsed, in priority order (most-retried first within a
    /// class, then submission order).
    pub fn dispatch_due(
        &mut self,
        registry: &PeerRegistry,
        topology: &TopologyTracker,
        now: Instant,
        events: &EventSink,
    ) -> Vec<SendAction> {
        let mut due: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| match entry.phase {
                Phase::Queued => true,
                Phase::Backoff { resume } => resume <= now,
                Phase::AwaitingAck { .. } => false,
            })
            .map(|(id, _)| id.clone())
            .collect();
        due.sort_by_key(|id| {
            let entry = &self.in_flight[id];
            (entry.priority, std::cmp::Reverse(entry.attempts), entry.seq)
        });

        let mut actions = Vec::new();
        for message_id in due {
            let Some(entry) = self.in_flight.get_mut(&message_id) else {
                continue;
            };
            let targets = select_targets(
                registry,
                topology,
                entry.destination.as_ref(),
                &entry.frame.path,
                &entry.acked,
            );
            if targets.is_empty() {
                if !entry.acked.is_empty() {
                    // Nothing left to send to and at least one hop has
                    // confirmed: the message is delivered, possibly by an
                    // ack that landed during backoff.
                    self.complete(&message_id, events);
                } else {
                    match entry.origin {
                        Origin::Local => {
                            entry.last_error = Some("no reachable peers".to_string());
                            self.fail(&message_id, events);
                        }
                        // A relay with nowhere further to go reached the
                        // mesh edge; that is not a delivery failure.
                        Origin::Relay => {
                            trace!(message_id = %message_id, "relay reached mesh edge, dropped");
                            self.in_flight.remove(&message_id);
                        }
                    }
                }
                continue;
            }

            entry.attempts += 1;
            entry.phase = Phase::AwaitingAck {
                deadline: now + entry.policy.timeout,
            };
            entry.targets = targets.iter().cloned().collect();
            if entry.origin == Origin::Local {
                events.emit(MeshEvent::MessageStatus {
                    message_id: message_id.clone(),
                    status: DeliveryStatus::Pending,
                    attempts: entry.attempts,
                    error: None,
                });
            }
            let bytes = entry.frame.to_bytes();
            for to in targets {
                actions.push(SendAction {
                    message_id: message_id.clone(),
                    to,
                    bytes: bytes.clone(),
                });
            }
        }
        actions
    }

    fn track(
        &mut self,
        frame: AppFrame,
        destination: Option<DeviceId>,
        origin: Origin,
        policy: Option<RetryPolicy>,
        priority: Option<Priority>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(
            frame.message_id.clone(),
            PendingDelivery {
                frame,
                destination,
                origin,
                priority: priority.unwrap_or_default(),
                policy: policy.unwrap_or_default(),
                attempts: 0,
                phase: Phase::Queued,
                targets: HashSet::new(),
                acked: HashSet::new(),
                seq,
                last_error: None,
            },
        );
    }

    fn relay_backlog(&self) -> usize {
        self.in_flight
            .values()
            .filter(|entry| entry.origin == Origin::Relay)
            .count()
    }

    /// The current attempt failed. Schedule the next one with linear
    /// backoff, or go terminal once the policy is exhausted.
    fn retry_or_fail(&mut self, message_id: &MessageId, now: Instant, events: &EventSink) {
        let Some(entry) = self.in_flight.get_mut(message_id) else {
            return;
        };
        if entry.attempts < entry.policy.max_attempts {
            let backoff = entry.policy.backoff * entry.attempts.max(1);
            entry.phase = Phase::Backoff {
                resume: now + backoff,
            };
            debug!(
                message_id = %message_id,
                attempts = entry.attempts,
                backoff_ms = backoff.as_millis() as u64,
                "attempt failed, retry scheduled"
            );
        } else {
            self.fail(message_id, events);
        }
    }

    fn complete(&mut self, message_id: &MessageId, events: &EventSink) {
        let Some(entry) = self.in_flight.remove(message_id) else {
            return;
        };
        debug!(message_id = %message_id, attempts = entry.attempts, "message delivered");
        if entry.origin == Origin::Local {
            events.emit(MeshEvent::MessageStatus {
                message_id: message_id.clone(),
                status: DeliveryStatus::Success,
                attempts: entry.attempts,
                error: None,
            });
        }
    }

    fn fail(&mut self, message_id: &MessageId, events: &EventSink) {
        let Some(entry) = self.in_flight.remove(message_id) else {
            return;
        };
        debug!(
            message_id = %message_id,
            attempts = entry.attempts,
            error = entry.last_error.as_deref().unwrap_or("unknown"),
            "message failed terminally"
        );
        if entry.origin == Origin::Local {
            events.emit(MeshEvent::MessageStatus {
                message_id: message_id.clone(),
                status: DeliveryStatus::Failed,
                attempts: entry.attempts,
                error: entry.last_error,
            });
        }
    }
}

/// Pick the peers an attempt goes to.
///
/// A directly connected destination is the sole target. Otherwise up to
/// `target_redundancy` neighbors not already on the path (and not already
/// acked) are chosen: healthiest link first when adaptive routing is on,
/// least-loaded neighbors preferred as a tiebreak when load balancing is
/// on, stable id order when both are off.
fn select_targets(
    registry: &PeerRegistry,
    topology: &TopologyTracker,
    destination: Option<&DeviceId>,
    path: &[DeviceId],
    acked: &HashSet<DeviceId>,
) -> Vec<DeviceId> {
    if let Some(dest) = destination {
        if registry.contains(dest) {
            if acked.contains(dest) {
                return Vec::new();
            }
            return vec![dest.clone()];
        }
    }

    let config = topology.config();
    let mut candidates: Vec<DeviceId> = registry
        .device_ids()
        .into_iter()
        .filter(|id| !path.contains(id) && !acked.contains(id) && Some(id) != destination)
        .collect();

    candidates.sort_by_key(|id| {
        let interval_ms = registry
            .get(id)
            .map(|peer| peer.keepalive_interval.as_millis() as u64)
            .unwrap_or(u64::MAX);
        let load = topology
            .get(id)
            .map(|entry| entry.connection_count)
            .unwrap_or(0);
        let (primary, secondary) = match (config.adaptive_routing, config.load_balancing) {
            (true, true) => (interval_ms, load as u64),
            (true, false) => (interval_ms, 0),
            (false, true) => (load as u64, 0),
            (false, false) => (0, 0),
        };
        (primary, secondary, id.clone())
    });
    candidates.truncate(config.target_redundancy);
    candidates
}
