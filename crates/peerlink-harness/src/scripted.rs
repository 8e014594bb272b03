//! Scripted Transport
//!
//! A fake transport driven entirely by the test. Events are queued up front (or
//! pushed while the loop runs) and every poll is recorded, so tests can assert
//! exactly how the event loop drained the queue, how often it blocked and
//! whether it flushed on the way out.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use peerlink_core::{
    ConnectionState, PacketBuffer, PeerSnapshot, SendError, Transport, TransportError,
    TransportEvent,
};
use tracing::trace;

/// One poll or flush performed on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCall {
    /// Non-blocking check; `hit` when it returned an event
    Check { hit: bool },
    /// Blocking service; `hit` when it returned an event
    Service { hit: bool },
    Flush,
}

/// Packet buffer that counts its own release
#[derive(Debug)]
pub struct ScriptedPacket {
    bytes: Vec<u8>,
    released: Arc<AtomicU64>,
}

impl PacketBuffer for ScriptedPacket {
    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for ScriptedPacket {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

type ScriptedEvent = TransportEvent<u32, ScriptedPacket>;

#[derive(Debug, Clone)]
struct ScriptedPeer {
    address: SocketAddr,
    state: ConnectionState,
    packets_sent: u64,
}

#[derive(Default)]
struct ScriptState {
    queue: VecDeque<ScriptedEvent>,
    peers: HashMap<u32, ScriptedPeer>,
    calls: Vec<ScriptCall>,
    sent: Vec<(u32, u8, Vec<u8>)>,
    disconnects: Vec<(u32, u32)>,
    failing_services: usize,
    next_peer: u32,
}

/// Fake transport whose peers are plain `u32` ids
pub struct ScriptedTransport {
    state: Mutex<ScriptState>,
    ready: Condvar,
    released: Arc<AtomicU64>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                next_peer: 1000,
                ..ScriptState::default()
            }),
            ready: Condvar::new(),
            released: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Queue a raw event
    pub fn push_event(&self, event: ScriptedEvent) {
        let mut state = self.lock();
        state.queue.push_back(event);
        self.ready.notify_all();
    }

    /// Queue a connect from `peer` at `address`; the peer becomes sendable immediately
    pub fn queue_connect(&self, peer: u32, address: SocketAddr) {
        let mut state = self.lock();
        state.peers.insert(
            peer,
            ScriptedPeer {
                address,
                state: ConnectionState::Connected,
                packets_sent: 0,
            },
        );
        state.queue.push_back(TransportEvent::Connect { peer, data: 0 });
        self.ready.notify_all();
    }

    pub fn queue_receive(&self, peer: u32, channel: u8, bytes: &[u8]) {
        let packet = ScriptedPacket {
            bytes: bytes.to_vec(),
            released: self.released.clone(),
        };
        self.push_event(TransportEvent::Receive {
            peer,
            channel,
            packet,
        });
    }

    pub fn queue_disconnect(&self, peer: u32, data: u32) {
        let mut state = self.lock();
        if let Some(entry) = state.peers.get_mut(&peer) {
            entry.state = ConnectionState::Disconnected;
        }
        state.queue.push_back(TransportEvent::Disconnect { peer, data });
        self.ready.notify_all();
    }

    pub fn queue_timeout(&self, peer: u32) {
        let mut state = self.lock();
        if let Some(entry) = state.peers.get_mut(&peer) {
            entry.state = ConnectionState::Zombie;
        }
        state.queue.push_back(TransportEvent::Timeout { peer });
        self.ready.notify_all();
    }

    /// Make the next `count` blocking services fail with a poll error
    pub fn fail_next_services(&self, count: usize) {
        self.lock().failing_services = count;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<ScriptCall> {
        self.lock().calls.clone()
    }

    pub fn pending_events(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn flushes(&self) -> usize {
        self.count(|call| matches!(call, ScriptCall::Flush))
    }

    pub fn blocking_waits(&self) -> usize {
        self.count(|call| matches!(call, ScriptCall::Service { .. }))
    }

    pub fn packets_released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Every accepted send as `(peer, channel, bytes)`
    pub fn sent(&self) -> Vec<(u32, u8, Vec<u8>)> {
        self.lock().sent.clone()
    }

    /// Every requested disconnect as `(peer, data)`
    pub fn disconnects(&self) -> Vec<(u32, u32)> {
        self.lock().disconnects.clone()
    }

    fn count(&self, predicate: impl Fn(&ScriptCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }
}

impl Transport for ScriptedTransport {
    type Peer = u32;
    type Packet = ScriptedPacket;

    fn connect(&self, address: SocketAddr, _channel_limit: u8) -> Result<u32, TransportError> {
        let mut state = self.lock();
        let peer = state.next_peer;
        state.next_peer += 1;
        state.peers.insert(
            peer,
            ScriptedPeer {
                address,
                state: ConnectionState::Connecting,
                packets_sent: 0,
            },
        );
        trace!(peer, %address, "scripted connect");
        Ok(peer)
    }

    fn check_events(&self) -> Result<Option<ScriptedEvent>, TransportError> {
        let mut state = self.lock();
        let event = state.queue.pop_front();
        state.calls.push(ScriptCall::Check {
            hit: event.is_some(),
        });
        Ok(event)
    }

    fn service(&self, timeout: Duration) -> Result<Option<ScriptedEvent>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        if state.failing_services > 0 {
            state.failing_services -= 1;
            state.calls.push(ScriptCall::Service { hit: false });
            return Err(TransportError::Poll { code: -1 });
        }
        loop {
            if let Some(event) = state.queue.pop_front() {
                state.calls.push(ScriptCall::Service { hit: true });
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                state.calls.push(ScriptCall::Service { hit: false });
                return Ok(None);
            }
            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn flush(&self) {
        self.lock().calls.push(ScriptCall::Flush);
    }

    fn disconnect(&self, peer: &u32, data: u32) {
        let mut state = self.lock();
        if let Some(entry) = state.peers.get_mut(peer) {
            entry.state = ConnectionState::Disconnecting;
        }
        state.disconnects.push((*peer, data));
    }

    fn send(&self, peer: &u32, channel: u8, payload: &[u8]) -> Result<(), SendError> {
        let mut state = self.lock();
        let entry = state.peers.get_mut(peer).ok_or(SendError::NoPeer)?;
        if !entry.state.can_send() {
            return Err(SendError::NotConnected { state: entry.state });
        }
        entry.packets_sent += 1;
        state.sent.push((*peer, channel, payload.to_vec()));
        Ok(())
    }

    fn snapshot(&self, peer: &u32) -> PeerSnapshot {
        let state = self.lock();
        match state.peers.get(peer) {
            Some(entry) => PeerSnapshot::new(
                entry.address.ip().to_string(),
                entry.address.port(),
                entry.state,
            )
            .with_packet_counters(entry.packets_sent, 0),
            None => PeerSnapshot::new("0.0.0.0", 0, ConnectionState::Uninitialized),
        }
    }
}
