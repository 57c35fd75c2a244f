//! # Transport Seam
//!
//! The engine does not establish connections itself; the transport-bootstrap
//! layer (ICE/SDP negotiation, NFC, QR exchange) hands each peer's
//! send endpoint to the registry as a [`FrameSink`] and feeds inbound frames
//! back through `MeshNode::handle_frame`.
//!
//! The trait is defined here, separately from any implementation, so the
//! core depends only on the seam and tests can substitute their own sinks.
//!
//! [`MemoryLink`] is the in-process reference transport: a bounded,
//! lossy-when-full datagram pipe used by the demo binary and the
//! integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

/// Default in-flight capacity of a [`MemoryLink`] direction.
pub const MEMORY_LINK_CAPACITY: usize = 256;

/// A peer's send endpoint.
///
/// Sends are fire-and-forget: the engine never blocks waiting for delivery,
/// and a failed send is converted into a loss-rate sample rather than an
/// eviction. Closing a sink releases the underlying channel; further sends
/// fail with [`TransportError::ChannelClosed`].
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Write one frame to the peer.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Release the underlying channel. Idempotent.
    fn close(&self);

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;
}

/// Errors surfaced by a transport send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel was closed, locally or by the remote side.
    ChannelClosed,
    /// The transport reported a send failure.
    SendFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "channel is closed"),
            Self::SendFailed(reason) => write!(f, "transport send failed: {}", reason),
        }
    }
}

impl std::error::Error for TransportError {}

/// One half of an in-process datagram link.
///
/// `MemoryLink::pair` returns two halves; frames sent on one half arrive on
/// the receiver handed out with the other. The pipe is bounded and drops
/// frames when full, which models the unreliable datagram transports the
/// engine runs over in production.
pub struct MemoryLink {
    outbound: mpsc::Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl MemoryLink {
    /// Create a connected pair of links with the given per-direction
    /// capacity. Returns each half together with the receiver yielding the
    /// frames the *other* half sends.
    pub fn pair(
        capacity: usize,
    ) -> (
        (MemoryLink, mpsc::Receiver<Vec<u8>>),
        (MemoryLink, mpsc::Receiver<Vec<u8>>),
    ) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::channel(capacity);
        let (b_to_a_tx, b_to_a_rx) = mpsc::channel(capacity);
        let open = Arc::new(AtomicBool::new(true));

        let a = MemoryLink {
            outbound: a_to_b_tx,
            open: open.clone(),
        };
        let b = MemoryLink {
            outbound: b_to_a_tx,
            open,
        };
        ((a, b_to_a_rx), (b, a_to_b_rx))
    }
}

#[async_trait]
impl FrameSink for MemoryLink {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed);
        }
        match self.outbound.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            // A full pipe behaves like a lossy network: the frame is gone,
            // the send itself did not fail.
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("memory link full, frame dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::ChannelClosed),
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_the_pair_in_both_directions() {
        let ((a, mut a_rx), (b, mut b_rx)) = MemoryLink::pair(8);

        a.send(b"from a").await.unwrap();
        b.send(b"from b").await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), b"from a");
        assert_eq!(a_rx.recv().await.unwrap(), b"from b");
    }

    #[tokio::test]
    async fn closing_either_half_closes_the_link() {
        let ((a, _a_rx), (b, _b_rx)) = MemoryLink::pair(8);

        assert!(a.is_open());
        b.close();
        assert!(!a.is_open());
        assert_eq!(a.send(b"x").await, Err(TransportError::ChannelClosed));
    }

    #[tokio::test]
    async fn full_link_drops_frames_without_failing() {
        let ((a, _a_rx), (_b, mut b_rx)) = MemoryLink::pair(1);

        a.send(b"first").await.unwrap();
        // Second frame exceeds capacity and is silently dropped.
        a.send(b"second").await.unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), b"first");
        assert!(b_rx.try_recv().is_err());
    }
}
