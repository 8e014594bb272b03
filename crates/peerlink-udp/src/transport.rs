//! UDP Transport
//!
//! [`UdpHost`] adapts one non-blocking laminar [`Socket`] to the peerlink
//! transport contract. laminar provides reliable ordered delivery, heartbeats and
//! idle timeouts per remote address; this module layers sessions on top with the
//! frames in [`crate::frame`]: a hello exchange opens a session and negotiates
//! its channel count, a goodbye closes it with a data word.
//!
//! Each session gets its own [`UdpPeer`] id, so a peer that reconnects from the
//! same address is a different handle. One address holds at most one live
//! session per endpoint.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use laminar::{Packet, Socket, SocketEvent};
use peerlink_core::{
    ConnectionState, PeerSnapshot, SendError, Transport, TransportError, TransportEvent,
    TransportProvider, MAX_CHANNELS, MAX_PEERS,
};
use tracing::{debug, trace};

use crate::config::UdpConfig;
use crate::frame::Frame;

type UdpEvent = TransportEvent<UdpPeer, Vec<u8>>;

// ----------------------------------------------------------------------------
// Provider
// ----------------------------------------------------------------------------

/// Creates socket-backed endpoints
#[derive(Debug, Clone, Default)]
pub struct UdpProvider {
    config: UdpConfig,
}

impl UdpProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: UdpConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &UdpConfig {
        &self.config
    }
}

impl TransportProvider for UdpProvider {
    type Transport = UdpHost;

    fn create_endpoint(&self) -> Result<UdpHost, TransportError> {
        let bind = SocketAddr::new(self.config.client_bind_address, 0);
        UdpHost::bind(bind, false, MAX_PEERS, MAX_CHANNELS as u8, self.config.clone())
    }

    fn create_listener(
        &self,
        bind: SocketAddr,
        max_peers: usize,
        channel_limit: u8,
    ) -> Result<UdpHost, TransportError> {
        UdpHost::bind(bind, true, max_peers, channel_limit, self.config.clone())
    }
}

// ----------------------------------------------------------------------------
// Peers
// ----------------------------------------------------------------------------

/// Handle to one session of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpPeer {
    id: u64,
    address: SocketAddr,
}

impl UdpPeer {
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

struct Session {
    address: SocketAddr,
    state: ConnectionState,
    channel_limit: u8,
    packets_sent: u64,
    last_send_time: u32,
    last_receive_time: u32,
    opened: Instant,
}

struct HostState {
    socket: Socket,
    sessions: HashMap<u64, Session>,
    /// Live session per remote address
    live: HashMap<SocketAddr, u64>,
    events: VecDeque<UdpEvent>,
    /// Sessions whose final event has been polled, oldest first
    retired: VecDeque<u64>,
    next_id: u64,
}

impl HostState {
    fn send_frame(&mut self, to: SocketAddr, frame: Frame<'_>) -> Result<(), String> {
        self.socket
            .send(Packet::reliable_ordered(to, frame.encode(), None))
            .map_err(|error| error.to_string())
    }

    fn open(&mut self, address: SocketAddr, state: ConnectionState, channel_limit: u8, now: u32) -> UdpPeer {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(
            id,
            Session {
                address,
                state,
                channel_limit,
                packets_sent: 0,
                last_send_time: 0,
                last_receive_time: now,
                opened: Instant::now(),
            },
        );
        self.live.insert(address, id);
        UdpPeer { id, address }
    }

    /// Move a live session to a terminal state; false if it already was
    fn close(&mut self, id: u64, state: ConnectionState) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        if session.state.is_terminal() {
            return false;
        }
        session.state = state;
        if self.live.get(&session.address) == Some(&id) {
            self.live.remove(&session.address);
        }
        true
    }

    fn peer(&self, id: u64) -> Option<UdpPeer> {
        self.sessions.get(&id).map(|session| UdpPeer {
            id,
            address: session.address,
        })
    }

    fn pop(&mut self, retain: usize) -> Option<UdpEvent> {
        let event = self.events.pop_front()?;
        let finished = match &event {
            TransportEvent::Disconnect { peer, .. } | TransportEvent::Timeout { peer } => Some(peer.id),
            _ => None,
        };
        if let Some(id) = finished {
            self.retired.push_back(id);
            while self.retired.len() > retain.max(1) {
                let Some(oldest) = self.retired.pop_front() else {
                    break;
                };
                if self
                    .sessions
                    .get(&oldest)
                    .is_some_and(|session| session.state.is_terminal())
                {
                    self.sessions.remove(&oldest);
                }
            }
        }
        Some(event)
    }
}

// ----------------------------------------------------------------------------
// UDP Host
// ----------------------------------------------------------------------------

/// One bound UDP socket and the sessions running over it
pub struct UdpHost {
    local_addr: SocketAddr,
    accepts_incoming: bool,
    max_peers: usize,
    channel_limit: u8,
    config: UdpConfig,
    epoch: Instant,
    state: Mutex<HostState>,
}

impl UdpHost {
    fn bind(
        address: SocketAddr,
        accepts_incoming: bool,
        max_peers: usize,
        channel_limit: u8,
        config: UdpConfig,
    ) -> Result<Self, TransportError> {
        let socket = Socket::bind_with_config(address, config.laminar_config())
            .map_err(|error| TransportError::bind(address, error.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|error| TransportError::bind(address, error.to_string()))?;
        debug!(%local_addr, accepts_incoming, max_peers, "udp endpoint bound");

        Ok(Self {
            local_addr,
            accepts_incoming,
            max_peers,
            channel_limit: channel_limit.max(1),
            config,
            epoch: Instant::now(),
            state: Mutex::new(HostState {
                socket,
                sessions: HashMap::new(),
                live: HashMap::new(),
                events: VecDeque::new(),
                retired: VecDeque::new(),
                next_id: 1,
            }),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions that are connecting or connected
    pub fn live_sessions(&self) -> usize {
        self.lock().live.len()
    }

    /// Sessions still held, live or closed
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Exchange datagrams and turn whatever laminar reported into events
    fn pump(&self, state: &mut HostState) {
        state.socket.manual_poll(Instant::now());
        self.drain_socket(state);
    }

    fn drain_socket(&self, state: &mut HostState) {
        while let Some(event) = state.socket.recv() {
            match event {
                SocketEvent::Packet(packet) => self.handle_datagram(state, packet.addr(), packet.payload()),
                SocketEvent::Timeout(address) => {
                    if let Some(id) = state.live.get(&address).copied() {
                        self.time_out(state, id);
                    }
                }
                _ => {}
            }
        }
        self.expire_connecting(state);
    }

    fn handle_datagram(&self, state: &mut HostState, from: SocketAddr, bytes: &[u8]) {
        let Some(frame) = Frame::decode(bytes) else {
            trace!(%from, len = bytes.len(), "dropping foreign datagram");
            return;
        };
        let now = self.now();
        let live = state.live.get(&from).copied();

        match (frame, live) {
            (Frame::Hello { channels }, None) => self.accept(state, from, channels),
            (Frame::Hello { channels }, Some(id)) => {
                let Some(session) = state.sessions.get_mut(&id) else {
                    return;
                };
                if session.state != ConnectionState::Connecting {
                    return;
                }
                session.state = ConnectionState::Connected;
                session.channel_limit = session.channel_limit.min(channels).max(1);
                session.last_receive_time = now;
                debug!(peer = %from, channels = session.channel_limit, "udp session established");
                state.events.push_back(TransportEvent::Connect {
                    peer: UdpPeer { id, address: from },
                    data: 0,
                });
            }
            (Frame::Data { channel, payload }, Some(id)) => {
                let Some(session) = state.sessions.get_mut(&id) else {
                    return;
                };
                if !session.state.is_connected() {
                    return;
                }
                session.last_receive_time = now;
                state.events.push_back(TransportEvent::Receive {
                    peer: UdpPeer { id, address: from },
                    channel,
                    packet: payload.to_vec(),
                });
            }
            (Frame::Goodbye { data }, Some(id)) => {
                if state.close(id, ConnectionState::Disconnected) {
                    debug!(peer = %from, data, "udp session closed by remote");
                    state.events.push_back(TransportEvent::Disconnect {
                        peer: UdpPeer { id, address: from },
                        data,
                    });
                }
            }
            (Frame::Data { .. }, None) | (Frame::Goodbye { .. }, None) => {
                trace!(%from, "dropping frame without a session");
            }
        }
    }

    fn accept(&self, state: &mut HostState, from: SocketAddr, channels: u8) {
        if !self.accepts_incoming || state.live.len() >= self.max_peers {
            debug!(peer = %from, live = state.live.len(), "refusing udp session");
            if let Err(reason) = state.send_frame(from, Frame::Goodbye { data: 0 }) {
                debug!(peer = %from, %reason, "refusal was not sent");
            }
            return;
        }

        let negotiated = channels.min(self.channel_limit).max(1);
        if let Err(reason) = state.send_frame(from, Frame::Hello { channels: negotiated }) {
            debug!(peer = %from, %reason, "hello reply was not sent");
            return;
        }
        let peer = state.open(from, ConnectionState::Connected, negotiated, self.now());
        debug!(peer = %from, channels = negotiated, "udp session accepted");
        state.events.push_back(TransportEvent::Connect { peer, data: 0 });
    }

    fn time_out(&self, state: &mut HostState, id: u64) {
        if state.close(id, ConnectionState::Zombie) {
            if let Some(peer) = state.peer(id) {
                debug!(peer = %peer.address, "udp session timed out");
                state.events.push_back(TransportEvent::Timeout { peer });
            }
        }
    }

    fn expire_connecting(&self, state: &mut HostState) {
        let limit = self.config.connect_timeout();
        let expired: Vec<u64> = state
            .sessions
            .iter()
            .filter(|(_, session)| {
                session.state == ConnectionState::Connecting && session.opened.elapsed() >= limit
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.time_out(state, id);
        }
    }
}

impl Transport for UdpHost {
    type Peer = UdpPeer;
    type Packet = Vec<u8>;

    fn connect(&self, address: SocketAddr, channel_limit: u8) -> Result<UdpPeer, TransportError> {
        let mut state = self.lock();
        if state.live.contains_key(&address) {
            return Err(TransportError::connect_refused(
                address,
                "a session with this address is already open",
            ));
        }

        let channel_limit = channel_limit.max(1);
        state
            .send_frame(address, Frame::Hello { channels: channel_limit })
            .map_err(|reason| TransportError::connect_refused(address, reason))?;
        let peer = state.open(address, ConnectionState::Connecting, channel_limit, self.now());
        state.socket.manual_poll(Instant::now());
        debug!(%address, channel_limit, "udp connect started");
        Ok(peer)
    }

    fn check_events(&self) -> Result<Option<UdpEvent>, TransportError> {
        let retain = self.config.retained_closed_peers;
        let mut state = self.lock();
        if let Some(event) = state.pop(retain) {
            return Ok(Some(event));
        }
        self.drain_socket(&mut state);
        Ok(state.pop(retain))
    }

    fn service(&self, timeout: Duration) -> Result<Option<UdpEvent>, TransportError> {
        let retain = self.config.retained_closed_peers;
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                self.pump(&mut state);
                if let Some(event) = state.pop(retain) {
                    return Ok(Some(event));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.config.service_step().min(deadline - now));
        }
    }

    fn flush(&self) {
        self.lock().socket.manual_poll(Instant::now());
    }

    fn disconnect(&self, peer: &UdpPeer, data: u32) {
        let mut state = self.lock();
        if state.live.get(&peer.address) != Some(&peer.id) {
            return;
        }
        if let Err(reason) = state.send_frame(peer.address, Frame::Goodbye { data }) {
            debug!(peer = %peer.address, %reason, "goodbye was not sent");
        }
        if state.close(peer.id, ConnectionState::Disconnected) {
            state.events.push_back(TransportEvent::Disconnect { peer: *peer, data });
        }
    }

    fn send(&self, peer: &UdpPeer, channel: u8, payload: &[u8]) -> Result<(), SendError> {
        let now = self.now();
        let mut state = self.lock();
        let session = state.sessions.get(&peer.id).ok_or(SendError::NotConnected {
            state: ConnectionState::Disconnected,
        })?;
        if session.state != ConnectionState::Connected {
            return Err(SendError::NotConnected { state: session.state });
        }
        if channel >= session.channel_limit {
            return Err(SendError::InvalidChannel {
                channel,
                limit: session.channel_limit,
            });
        }
        if payload.len() > self.config.max_payload_size {
            return Err(SendError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        state
            .send_frame(peer.address, Frame::Data { channel, payload })
            .map_err(|reason| SendError::Rejected { reason })?;
        if let Some(session) = state.sessions.get_mut(&peer.id) {
            session.packets_sent += 1;
            session.last_send_time = now;
        }
        Ok(())
    }

    fn snapshot(&self, peer: &UdpPeer) -> PeerSnapshot {
        let state = self.lock();
        match state.sessions.get(&peer.id) {
            Some(session) => PeerSnapshot::new(
                session.address.ip().to_string(),
                session.address.port(),
                session.state,
            )
            .with_packet_counters(session.packets_sent, 0)
            .with_activity_times(session.last_receive_time, session.last_send_time),
            None => PeerSnapshot::new(
                Ipv4Addr::UNSPECIFIED.to_string(),
                0,
                ConnectionState::Uninitialized,
            ),
        }
    }
}
