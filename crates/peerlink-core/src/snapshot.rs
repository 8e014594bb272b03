//! Point-in-time peer snapshots
//!
//! A [`PeerSnapshot`] is copied out of the transport's live peer state when it is
//! built and never changes afterwards. Stale values are expected; callers that
//! need fresh statistics ask the endpoint for a new snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ConnectionState;

// ----------------------------------------------------------------------------
// Peer Snapshot
// ----------------------------------------------------------------------------

/// Immutable copy of one remote endpoint's identity and statistics
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerSnapshot {
    address: String,
    port: u16,
    connection_state: ConnectionState,
    packets_lost: u64,
    packets_sent: u64,
    last_receive_time: u32,
    last_send_time: u32,
    round_trip_time: u32,
}

impl PeerSnapshot {
    /// Start a snapshot with zeroed statistics.
    ///
    /// Transports fill in the counters with the `with_*` methods before handing
    /// the value out; none of them can be called on a shared snapshot.
    pub fn new<A: Into<String>>(address: A, port: u16, connection_state: ConnectionState) -> Self {
        Self {
            address: address.into(),
            port,
            connection_state,
            packets_lost: 0,
            packets_sent: 0,
            last_receive_time: 0,
            last_send_time: 0,
            round_trip_time: 0,
        }
    }

    pub fn with_packet_counters(mut self, packets_sent: u64, packets_lost: u64) -> Self {
        self.packets_sent = packets_sent;
        self.packets_lost = packets_lost;
        self
    }

    pub fn with_activity_times(mut self, last_receive_time: u32, last_send_time: u32) -> Self {
        self.last_receive_time = last_receive_time;
        self.last_send_time = last_send_time;
        self
    }

    pub fn with_round_trip_time(mut self, round_trip_time: u32) -> Self {
        self.round_trip_time = round_trip_time;
        self
    }

    /// Textual IP of the remote endpoint
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Transport-clock time of the last packet received from the peer
    pub fn last_receive_time(&self) -> u32 {
        self.last_receive_time
    }

    /// Transport-clock time of the last packet sent to the peer
    pub fn last_send_time(&self) -> u32 {
        self.last_send_time
    }

    /// Latest round-trip estimate in milliseconds
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }
}

impl fmt::Display for PeerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({}, rtt {}ms)",
            self.address, self.port, self.connection_state, self.round_trip_time
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods_fill_statistics() {
        let snapshot = PeerSnapshot::new("192.168.1.20", 40000, ConnectionState::Connected)
            .with_packet_counters(12, 3)
            .with_activity_times(500, 510)
            .with_round_trip_time(42);

        assert_eq!(snapshot.address(), "192.168.1.20");
        assert_eq!(snapshot.port(), 40000);
        assert_eq!(snapshot.packets_sent(), 12);
        assert_eq!(snapshot.packets_lost(), 3);
        assert_eq!(snapshot.last_receive_time(), 500);
        assert_eq!(snapshot.last_send_time(), 510);
        assert_eq!(snapshot.round_trip_time(), 42);
        assert_eq!(snapshot.to_string(), "192.168.1.20:40000 (connected, rtt 42ms)");
    }

    #[test]
    fn clones_are_independent_values() {
        let original = PeerSnapshot::new("10.0.0.1", 1, ConnectionState::Connecting);
        let copy = original.clone();
        let refreshed = original.clone().with_packet_counters(1, 0);

        assert_eq!(original, copy);
        assert_ne!(original, refreshed);
        assert_eq!(original.packets_sent(), 0);
    }
}
