//! Transport contract consumed by the session loop
//!
//! The reliable-UDP transport (retransmission, congestion control, framing) is an
//! external collaborator. peerlink only needs a handful of primitives from it:
//! create a local endpoint, connect to a peer, poll for events without blocking,
//! poll with a short timeout, flush, disconnect, send, and read peer statistics.

use std::fmt::Debug;
use std::hash::Hash;
use std::net::SocketAddr;
use std::time::Duration;

use crate::errors::{SendError, TransportError};
use crate::snapshot::PeerSnapshot;

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Raw event dequeued from a transport endpoint
#[derive(Debug)]
pub enum TransportEvent<P, B> {
    /// Nothing happened; returned by transports that report empty polls as events
    None,
    Connect { peer: P, data: u32 },
    Disconnect { peer: P, data: u32 },
    Timeout { peer: P },
    Receive { peer: P, channel: u8, packet: B },
}

impl<P, B> TransportEvent<P, B> {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::None => "None",
            TransportEvent::Connect { .. } => "Connect",
            TransportEvent::Disconnect { .. } => "Disconnect",
            TransportEvent::Timeout { .. } => "Timeout",
            TransportEvent::Receive { .. } => "Receive",
        }
    }
}

// ----------------------------------------------------------------------------
// Packet Buffers
// ----------------------------------------------------------------------------

/// A received packet still owned by the transport.
///
/// Dropping the value releases the underlying buffer back to the transport. The
/// event loop copies the bytes out and drops the buffer before any observer runs.
pub trait PacketBuffer: Send {
    fn as_bytes(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl PacketBuffer for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// One local transport endpoint
///
/// Methods take `&self` because sends arrive from arbitrary threads while the
/// event loop worker polls. Implementations whose underlying library is not
/// thread-safe must serialize internally, and must not hold that lock across the
/// blocking part of [`Transport::service`].
pub trait Transport: Send + Sync + 'static {
    /// Live connection handle; equality is transport identity, never address
    type Peer: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Received packet buffer, released on drop
    type Packet: PacketBuffer;

    /// Start a connection attempt. Completion is reported later as a
    /// `Connect`, `Disconnect` or `Timeout` event.
    fn connect(&self, address: SocketAddr, channel_limit: u8) -> Result<Self::Peer, TransportError>;

    /// Dequeue an already-queued event without blocking
    fn check_events(&self) -> Result<Option<TransportEvent<Self::Peer, Self::Packet>>, TransportError>;

    /// Exchange traffic and wait up to `timeout` for the next event
    fn service(
        &self,
        timeout: Duration,
    ) -> Result<Option<TransportEvent<Self::Peer, Self::Packet>>, TransportError>;

    /// Push everything queued for sending onto the wire, best effort
    fn flush(&self);

    /// Begin a graceful disconnect, passing `data` to the remote side
    fn disconnect(&self, peer: &Self::Peer, data: u32);

    /// Queue one packet for `peer` on `channel`
    fn send(&self, peer: &Self::Peer, channel: u8, payload: &[u8]) -> Result<(), SendError>;

    /// Copy the peer's current identity and statistics
    fn snapshot(&self, peer: &Self::Peer) -> PeerSnapshot;
}

/// Creates transport endpoints; stands in for library initialization
pub trait TransportProvider {
    type Transport: Transport;

    /// Unbound endpoint for outgoing connections (client side)
    fn create_endpoint(&self) -> Result<Self::Transport, TransportError>;

    /// Endpoint bound to `bind` that accepts up to `max_peers` connections
    fn create_listener(
        &self,
        bind: SocketAddr,
        max_peers: usize,
        channel_limit: u8,
    ) -> Result<Self::Transport, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_is_a_packet_buffer() {
        let packet: Vec<u8> = vec![7, 8];
        assert_eq!(PacketBuffer::as_bytes(&packet), &[7, 8]);
        assert_eq!(PacketBuffer::len(&packet), 2);
        assert!(!PacketBuffer::is_empty(&packet));
    }

    #[test]
    fn event_names() {
        let event: TransportEvent<u32, Vec<u8>> = TransportEvent::Timeout { peer: 1 };
        assert_eq!(event.name(), "Timeout");
        let event: TransportEvent<u32, Vec<u8>> = TransportEvent::None;
        assert_eq!(event.name(), "None");
    }
}
