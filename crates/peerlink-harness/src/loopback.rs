//! Loopback Transport
//!
//! An in-process network of transport endpoints that behaves like a reliable,
//! ordered, lossless link. Connects complete immediately when the target is bound,
//! sends are queued per endpoint and put "on the wire" by `service` or `flush`,
//! and graceful disconnects are delivered after any packets queued before them.
//!
//! Endpoints register in a shared [`LoopbackNetwork`] keyed by socket address.
//! Every endpoint lives on the network's single local IP, which makes shared
//! client addresses (and the roster's most-recent-match rule) easy to exercise.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use peerlink_core::{
    ConnectionState, PacketBuffer, PeerSnapshot, SendError, Transport, TransportError,
    TransportEvent, TransportProvider,
};
use tracing::{debug, trace};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

// ----------------------------------------------------------------------------
// Loopback Configuration
// ----------------------------------------------------------------------------

/// Behaviour of every endpoint on one loopback network
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// IP every endpoint on the network is reachable at
    pub local_ip: IpAddr,
    /// Packets an endpoint may have queued before sends are rejected
    pub outbound_capacity: usize,
    /// Largest accepted payload
    pub max_packet_size: usize,
    /// Round-trip time reported in peer snapshots
    pub round_trip_time_ms: u32,
    /// Closed slots an endpoint keeps after their final event was polled.
    /// Older ones are forgotten and snapshot as an unknown peer.
    pub retained_closed_slots: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            outbound_capacity: 1024,
            max_packet_size: 1024 * 1024,
            round_trip_time_ms: 1,
            retained_closed_slots: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Loopback Network
// ----------------------------------------------------------------------------

/// Shared registry of loopback endpoints; cheap to clone
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    config: LoopbackConfig,
    hosts: DashMap<SocketAddr, Weak<HostShared>>,
    next_host_id: AtomicU64,
    next_slot_id: AtomicU64,
    next_port: AtomicU16,
    epoch: Instant,
    packets_delivered: AtomicU64,
    packets_released: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_config(LoopbackConfig::default())
    }

    pub fn with_config(config: LoopbackConfig) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                config,
                hosts: DashMap::new(),
                next_host_id: AtomicU64::new(1),
                next_slot_id: AtomicU64::new(1),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
                epoch: Instant::now(),
                packets_delivered: AtomicU64::new(0),
                packets_released: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.inner.config
    }

    /// Packets that reached a remote inbox
    pub fn packets_delivered(&self) -> u64 {
        self.inner.packets_delivered.load(Ordering::Relaxed)
    }

    /// Received packet buffers that have been dropped by their consumer
    pub fn packets_released(&self) -> u64 {
        self.inner.packets_released.load(Ordering::Relaxed)
    }

    /// Whether an endpoint is currently bound at `address`
    pub fn is_bound(&self, address: SocketAddr) -> bool {
        self.lookup(self.normalize(address)).is_some()
    }

    /// Make the endpoint at `address` vanish without a goodbye.
    ///
    /// Every peer linked to it, and every peer it holds, reports a timeout.
    /// Returns false if nothing is bound there.
    pub fn partition(&self, address: SocketAddr) -> bool {
        let address = self.normalize(address);
        match self.lookup(address) {
            Some(host) => {
                debug!(%address, "partitioning loopback endpoint");
                host.time_out_all_links(true);
                true
            }
            None => false,
        }
    }

    fn normalize(&self, address: SocketAddr) -> SocketAddr {
        let ip = address.ip();
        if ip.is_unspecified() || ip.is_loopback() {
            SocketAddr::new(self.inner.config.local_ip, address.port())
        } else {
            address
        }
    }

    fn lookup(&self, address: SocketAddr) -> Option<Arc<HostShared>> {
        self.inner.hosts.get(&address).and_then(|entry| entry.upgrade())
    }

    fn now(&self) -> u32 {
        self.inner.epoch.elapsed().as_millis() as u32
    }

    fn next_ephemeral_port(&self) -> u16 {
        loop {
            let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
            if port >= FIRST_EPHEMERAL_PORT {
                return port;
            }
            self.inner.next_port.store(FIRST_EPHEMERAL_PORT, Ordering::Relaxed);
        }
    }

    fn bind(
        &self,
        requested: SocketAddr,
        max_peers: usize,
        channel_limit: u8,
    ) -> Result<LoopbackHost, TransportError> {
        let mut address = self.normalize(requested);
        if address.port() == 0 {
            address.set_port(self.next_ephemeral_port());
        }

        let shared = Arc::new(HostShared {
            id: self.inner.next_host_id.fetch_add(1, Ordering::Relaxed),
            address,
            max_peers,
            channel_limit,
            network: Arc::downgrade(&self.inner),
            state: Mutex::new(HostState::default()),
            ready: Condvar::new(),
        });

        match self.inner.hosts.entry(address) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some() {
                    return Err(TransportError::AddressInUse { address });
                }
                entry.insert(Arc::downgrade(&shared));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(&shared));
            }
        }

        debug!(%address, max_peers, "loopback endpoint bound");
        Ok(LoopbackHost {
            shared,
            network: self.clone(),
        })
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportProvider for LoopbackNetwork {
    type Transport = LoopbackHost;

    fn create_endpoint(&self) -> Result<LoopbackHost, TransportError> {
        let address = SocketAddr::new(self.inner.config.local_ip, 0);
        self.bind(address, peerlink_core::MAX_PEERS, peerlink_core::MAX_CHANNELS as u8)
    }

    fn create_listener(
        &self,
        bind: SocketAddr,
        max_peers: usize,
        channel_limit: u8,
    ) -> Result<LoopbackHost, TransportError> {
        self.bind(bind, max_peers, channel_limit)
    }
}

// ----------------------------------------------------------------------------
// Peers and Packets
// ----------------------------------------------------------------------------

/// Handle to one connection slot of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackPeer {
    host: u64,
    slot: u64,
}

/// Received payload; dropping it counts as releasing the buffer
#[derive(Debug)]
pub struct LoopbackPacket {
    bytes: Vec<u8>,
    released: Arc<AtomicU64>,
}

impl PacketBuffer for LoopbackPacket {
    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for LoopbackPacket {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Endpoint State
// ----------------------------------------------------------------------------

struct HostShared {
    id: u64,
    address: SocketAddr,
    max_peers: usize,
    channel_limit: u8,
    network: Weak<NetworkInner>,
    state: Mutex<HostState>,
    ready: Condvar,
}

#[derive(Default)]
struct HostState {
    inbox: VecDeque<Incoming>,
    outgoing: VecDeque<Outgoing>,
    slots: HashMap<u64, Slot>,
    /// Slots whose disconnect or timeout has been polled, oldest first
    retired: VecDeque<u64>,
    closed: bool,
}

struct Slot {
    remote_address: SocketAddr,
    state: ConnectionState,
    link: Option<Link>,
    channel_limit: u8,
    packets_sent: u64,
    packets_lost: u64,
    last_send_time: u32,
    last_receive_time: u32,
}

#[derive(Clone)]
struct Link {
    host: Weak<HostShared>,
    slot: u64,
}

enum Incoming {
    Connect { slot: u64 },
    Disconnect { slot: u64, data: u32 },
    Timeout { slot: u64 },
    Receive { slot: u64, channel: u8, bytes: Vec<u8> },
}

enum Outgoing {
    Packet { from: u64, link: Link, channel: u8, bytes: Vec<u8> },
    Disconnect { from: u64, link: Link, data: u32 },
}

impl HostShared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, state: &mut HostState, incoming: Incoming) {
        state.inbox.push_back(incoming);
        self.ready.notify_all();
    }

    /// Note a polled event; a final event retires its slot and the oldest
    /// retired slots beyond `retain` are dropped from the table
    fn retire(&self, state: &mut HostState, incoming: &Incoming, retain: usize) {
        let slot = match incoming {
            Incoming::Disconnect { slot, .. } | Incoming::Timeout { slot } => *slot,
            _ => return,
        };
        state.retired.push_back(slot);
        while state.retired.len() > retain.max(1) {
            let Some(oldest) = state.retired.pop_front() else {
                break;
            };
            if state
                .slots
                .get(&oldest)
                .is_some_and(|slot| slot.state.is_terminal() && slot.link.is_none())
            {
                state.slots.remove(&oldest);
                trace!(address = %self.address, slot = oldest, "reaped closed slot");
            }
        }
    }

    fn now(&self) -> u32 {
        self.network
            .upgrade()
            .map(|network| network.epoch.elapsed().as_millis() as u32)
            .unwrap_or(0)
    }

    /// Register an incoming connection from `from`
    fn accept(
        &self,
        from: SocketAddr,
        link: Link,
        requested_channels: u8,
    ) -> Result<(u64, u8), String> {
        let network = self.network.upgrade().ok_or("network is gone")?;
        let mut state = self.lock();
        if state.closed {
            return Err("endpoint closed".to_string());
        }
        let connected = state
            .slots
            .values()
            .filter(|slot| !slot.state.is_terminal())
            .count();
        if connected >= self.max_peers {
            return Err(format!("peer limit {} reached", self.max_peers));
        }

        let slot_id = network.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let channel_limit = requested_channels.min(self.channel_limit).max(1);
        let now = network.epoch.elapsed().as_millis() as u32;
        state.slots.insert(
            slot_id,
            Slot {
                remote_address: from,
                state: ConnectionState::Connected,
                link: Some(link),
                channel_limit,
                packets_sent: 0,
                packets_lost: 0,
                last_send_time: 0,
                last_receive_time: now,
            },
        );
        self.push(&mut state, Incoming::Connect { slot: slot_id });
        Ok((slot_id, channel_limit))
    }

    /// Put queued outbound traffic into the remote inboxes
    fn deliver_outgoing(&self) {
        let outgoing: Vec<Outgoing> = self.lock().outgoing.drain(..).collect();
        for item in outgoing {
            match item {
                Outgoing::Packet {
                    from,
                    link,
                    channel,
                    bytes,
                } => {
                    let delivered = link
                        .host
                        .upgrade()
                        .map(|remote| remote.receive_packet(link.slot, channel, bytes))
                        .unwrap_or(false);
                    if !delivered {
                        if let Some(slot) = self.lock().slots.get_mut(&from) {
                            slot.packets_lost += 1;
                        }
                    }
                }
                Outgoing::Disconnect { from, link, data } => {
                    if let Some(remote) = link.host.upgrade() {
                        remote.remote_disconnected(link.slot, data);
                    }
                    let mut state = self.lock();
                    if let Some(slot) = state.slots.get_mut(&from) {
                        slot.state = ConnectionState::Disconnected;
                        slot.link = None;
                        self.push(&mut state, Incoming::Disconnect { slot: from, data });
                    }
                }
            }
        }
    }

    fn receive_packet(&self, slot_id: u64, channel: u8, bytes: Vec<u8>) -> bool {
        let now = self.now();
        let mut state = self.lock();
        let accepted = match state.slots.get_mut(&slot_id) {
            Some(slot) if slot.state.is_connected() => {
                slot.last_receive_time = now;
                true
            }
            _ => false,
        };
        if accepted {
            if let Some(network) = self.network.upgrade() {
                network.packets_delivered.fetch_add(1, Ordering::Relaxed);
            }
            self.push(
                &mut state,
                Incoming::Receive {
                    slot: slot_id,
                    channel,
                    bytes,
                },
            );
        }
        accepted
    }

    fn remote_disconnected(&self, slot_id: u64, data: u32) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(&slot_id) {
            if slot.link.is_some() {
                slot.state = ConnectionState::Disconnected;
                slot.link = None;
                self.push(&mut state, Incoming::Disconnect { slot: slot_id, data });
            }
        }
    }

    fn remote_timed_out(&self, slot_id: u64) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(&slot_id) {
            if slot.link.is_some() {
                slot.state = ConnectionState::Zombie;
                slot.link = None;
                self.push(&mut state, Incoming::Timeout { slot: slot_id });
            }
        }
    }

    /// Sever every link. Remote sides see a timeout; so does this side when
    /// `report_locally` is set.
    fn time_out_all_links(&self, report_locally: bool) {
        if let Some(network) = self.network.upgrade() {
            network.hosts.remove_if(&self.address, |_, weak| {
                weak.upgrade().map(|h| h.id == self.id).unwrap_or(true)
            });
        }

        let links: Vec<Link> = {
            let mut state = self.lock();
            state.closed = true;
            state.outgoing.clear();
            let mut links = Vec::new();
            let mut timed_out = Vec::new();
            for (id, slot) in state.slots.iter_mut() {
                if let Some(link) = slot.link.take() {
                    slot.state = ConnectionState::Zombie;
                    links.push(link);
                    timed_out.push(*id);
                }
            }
            if report_locally {
                for id in timed_out {
                    self.push(&mut state, Incoming::Timeout { slot: id });
                }
            }
            links
        };

        for link in links {
            if let Some(remote) = link.host.upgrade() {
                remote.remote_timed_out(link.slot);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Loopback Host
// ----------------------------------------------------------------------------

/// One endpoint on a [`LoopbackNetwork`]
pub struct LoopbackHost {
    shared: Arc<HostShared>,
    network: LoopbackNetwork,
}

impl LoopbackHost {
    /// Address other endpoints see this one at
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.address
    }

    /// Packets queued locally and not yet put on the wire
    pub fn pending_outgoing(&self) -> usize {
        self.shared.lock().outgoing.len()
    }

    /// Events waiting to be polled
    pub fn pending_events(&self) -> usize {
        self.shared.lock().inbox.len()
    }

    /// Connection slots still held, live or closed
    pub fn slot_count(&self) -> usize {
        self.shared.lock().slots.len()
    }

    fn peer(&self, slot: u64) -> LoopbackPeer {
        LoopbackPeer {
            host: self.shared.id,
            slot,
        }
    }

    fn convert(&self, incoming: Incoming) -> TransportEvent<LoopbackPeer, LoopbackPacket> {
        match incoming {
            Incoming::Connect { slot } => TransportEvent::Connect {
                peer: self.peer(slot),
                data: 0,
            },
            Incoming::Disconnect { slot, data } => TransportEvent::Disconnect {
                peer: self.peer(slot),
                data,
            },
            Incoming::Timeout { slot } => TransportEvent::Timeout {
                peer: self.peer(slot),
            },
            Incoming::Receive {
                slot,
                channel,
                bytes,
            } => TransportEvent::Receive {
                peer: self.peer(slot),
                channel,
                packet: LoopbackPacket {
                    bytes,
                    released: self.network.inner.packets_released.clone(),
                },
            },
        }
    }

    fn pop(&self) -> Option<TransportEvent<LoopbackPeer, LoopbackPacket>> {
        let mut state = self.shared.lock();
        let incoming = state.inbox.pop_front()?;
        self.shared.retire(&mut state, &incoming, self.retain());
        drop(state);
        Some(self.convert(incoming))
    }

    fn retain(&self) -> usize {
        self.network.inner.config.retained_closed_slots
    }

    fn owns(&self, peer: &LoopbackPeer) -> bool {
        peer.host == self.shared.id
    }
}

impl Transport for LoopbackHost {
    type Peer = LoopbackPeer;
    type Packet = LoopbackPacket;

    fn connect(&self, address: SocketAddr, channel_limit: u8) -> Result<LoopbackPeer, TransportError> {
        let address = self.network.normalize(address);
        let slot_id = self.network.inner.next_slot_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.slots.insert(
                slot_id,
                Slot {
                    remote_address: address,
                    state: ConnectionState::Connecting,
                    link: None,
                    channel_limit: channel_limit.max(1),
                    packets_sent: 0,
                    packets_lost: 0,
                    last_send_time: 0,
                    last_receive_time: 0,
                },
            );
        }

        let outcome = match self.network.lookup(address) {
            Some(remote) if remote.id != self.shared.id => remote
                .accept(
                    self.shared.address,
                    Link {
                        host: Arc::downgrade(&self.shared),
                        slot: slot_id,
                    },
                    channel_limit.max(1),
                )
                .map(|(remote_slot, negotiated)| {
                    (
                        Link {
                            host: Arc::downgrade(&remote),
                            slot: remote_slot,
                        },
                        negotiated,
                    )
                })
                .map_err(Some),
            Some(_) => Err(Some("cannot connect to self".to_string())),
            None => Err(None),
        };

        let mut state = self.shared.lock();
        let Some(slot) = state.slots.get_mut(&slot_id) else {
            return Err(TransportError::Closed);
        };
        let incoming = match outcome {
            Ok((link, negotiated)) => {
                slot.state = ConnectionState::Connected;
                slot.link = Some(link);
                slot.channel_limit = negotiated;
                slot.last_receive_time = self.network.now();
                Incoming::Connect { slot: slot_id }
            }
            Err(Some(reason)) => {
                debug!(%address, %reason, "loopback connect refused");
                slot.state = ConnectionState::Disconnected;
                Incoming::Disconnect {
                    slot: slot_id,
                    data: 0,
                }
            }
            Err(None) => {
                debug!(%address, "nothing bound at address; connect times out");
                slot.state = ConnectionState::Zombie;
                Incoming::Timeout { slot: slot_id }
            }
        };
        self.shared.push(&mut state, incoming);
        Ok(self.peer(slot_id))
    }

    fn check_events(
        &self,
    ) -> Result<Option<TransportEvent<LoopbackPeer, LoopbackPacket>>, TransportError> {
        Ok(self.pop())
    }

    fn service(
        &self,
        timeout: Duration,
    ) -> Result<Option<TransportEvent<LoopbackPeer, LoopbackPacket>>, TransportError> {
        self.shared.deliver_outgoing();

        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(incoming) = state.inbox.pop_front() {
                self.shared.retire(&mut state, &incoming, self.retain());
                drop(state);
                return Ok(Some(self.convert(incoming)));
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(address = %self.shared.address, "service timed out");
                return Ok(None);
            }
            state = self
                .shared
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn flush(&self) {
        self.shared.deliver_outgoing();
    }

    fn disconnect(&self, peer: &LoopbackPeer, data: u32) {
        if !self.owns(peer) {
            return;
        }
        let mut state = self.shared.lock();
        let queued = match state.slots.get_mut(&peer.slot) {
            Some(slot) if slot.state.is_connected() => slot.link.clone().map(|link| {
                slot.state = ConnectionState::Disconnecting;
                link
            }),
            _ => None,
        };
        if let Some(link) = queued {
            state.outgoing.push_back(Outgoing::Disconnect {
                from: peer.slot,
                link,
                data,
            });
        }
    }

    fn send(&self, peer: &LoopbackPeer, channel: u8, payload: &[u8]) -> Result<(), SendError> {
        let config = &self.network.inner.config;
        let now = self.network.now();
        let mut state = self.shared.lock();
        let outgoing_len = state.outgoing.len();

        let slot = match state.slots.get_mut(&peer.slot) {
            Some(slot) if self.owns(peer) => slot,
            _ => {
                return Err(SendError::NotConnected {
                    state: ConnectionState::Disconnected,
                })
            }
        };
        let link = match (&slot.link, slot.state) {
            (Some(link), ConnectionState::Connected) => link.clone(),
            (_, current) => return Err(SendError::NotConnected { state: current }),
        };
        if channel >= slot.channel_limit {
            return Err(SendError::InvalidChannel {
                channel,
                limit: slot.channel_limit,
            });
        }
        if payload.len() > config.max_packet_size {
            return Err(SendError::PayloadTooLarge {
                size: payload.len(),
                max: config.max_packet_size,
            });
        }
        if outgoing_len >= config.outbound_capacity {
            return Err(SendError::QueueFull {
                capacity: config.outbound_capacity,
            });
        }

        slot.packets_sent += 1;
        slot.last_send_time = now;
        state.outgoing.push_back(Outgoing::Packet {
            from: peer.slot,
            link,
            channel,
            bytes: payload.to_vec(),
        });
        Ok(())
    }

    fn snapshot(&self, peer: &LoopbackPeer) -> PeerSnapshot {
        let state = self.shared.lock();
        match state.slots.get(&peer.slot).filter(|_| self.owns(peer)) {
            Some(slot) => PeerSnapshot::new(
                slot.remote_address.ip().to_string(),
                slot.remote_address.port(),
                slot.state,
            )
            .with_packet_counters(slot.packets_sent, slot.packets_lost)
            .with_activity_times(slot.last_receive_time, slot.last_send_time)
            .with_round_trip_time(self.network.inner.config.round_trip_time_ms),
            None => PeerSnapshot::new(
                Ipv4Addr::UNSPECIFIED.to_string(),
                0,
                ConnectionState::Uninitialized,
            ),
        }
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        self.shared.time_out_all_links(false);
    }
}
