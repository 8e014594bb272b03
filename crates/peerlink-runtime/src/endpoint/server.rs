//! Server Endpoint
//!
//! Multi-peer endpoint: a bound listening transport endpoint, a roster of the
//! clients currently connected, and an event loop that keeps the roster current.
//! Clients are addressed by the `PeerSnapshot` handed out in notifications; the
//! snapshot's address is resolved back to a live peer through the roster.

use std::fmt;
use std::sync::Arc;

use peerlink_core::{
    PeerRoster, PeerSnapshot, SendError, ServerConfig, SessionResult, Transport,
    TransportProvider,
};
use tracing::{debug, info};

use crate::event_loop::{EventLoop, LoopState, LoopStatsSnapshot};
use crate::observers::ObserverRegistry;

/// Endpoint that accepts up to `max_clients` connections
pub struct Server<T: Transport> {
    transport: Arc<T>,
    roster: Arc<PeerRoster<T::Peer>>,
    observers: Arc<ObserverRegistry>,
    event_loop: EventLoop<T>,
    config: ServerConfig,
}

impl<T: Transport> Server<T> {
    /// Bind on every interface at `port`
    pub fn new<P>(provider: &P, port: u16, max_clients: usize) -> SessionResult<Self>
    where
        P: TransportProvider<Transport = T>,
    {
        Self::with_config(provider, ServerConfig::new(port, max_clients))
    }

    /// Validate `config` and bind immediately
    pub fn with_config<P>(provider: &P, config: ServerConfig) -> SessionResult<Self>
    where
        P: TransportProvider<Transport = T>,
    {
        config.validate()?;
        let bind = config.socket_addr();
        let transport = Arc::new(provider.create_listener(
            bind,
            config.max_clients,
            config.channel_limit,
        )?);
        info!(address = %bind, max_clients = config.max_clients, "server bound");

        let roster = Arc::new(PeerRoster::new());
        let observers = Arc::new(ObserverRegistry::new());
        let event_loop = EventLoop::with_roster(
            transport.clone(),
            observers.clone(),
            roster.clone(),
            config.event_loop.clone(),
        );

        Ok(Self {
            transport,
            roster,
            observers,
            event_loop,
            config,
        })
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send to the client `to` on the default channel; false if not queued
    pub fn send(&self, payload: &[u8], to: &PeerSnapshot) -> bool {
        self.send_on(self.config.default_channel, payload, to)
    }

    pub fn send_on(&self, channel: u8, payload: &[u8], to: &PeerSnapshot) -> bool {
        match self.try_send(channel, payload, to) {
            Ok(()) => true,
            Err(SendError::NoPeer) => {
                debug!(peer = %to.address(), "no connected client at address");
                false
            }
            Err(error) => {
                debug!(%error, peer = %to.address(), channel, "server send rejected");
                false
            }
        }
    }

    /// Send and report why the packet was not queued.
    ///
    /// When several live clients share the snapshot's address, the most recently
    /// connected one receives the packet.
    pub fn try_send(&self, channel: u8, payload: &[u8], to: &PeerSnapshot) -> Result<(), SendError> {
        let peer = self.roster.find(to.address()).ok_or(SendError::NoPeer)?;
        self.transport.send(&peer, channel, payload)
    }

    /// Queue `payload` for every connected client; returns how many accepted it
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let channel = self.config.default_channel;
        self.roster
            .handles()
            .iter()
            .filter(|peer| match self.transport.send(peer, channel, payload) {
                Ok(()) => true,
                Err(error) => {
                    debug!(%error, ?peer, "broadcast skipped peer");
                    false
                }
            })
            .count()
    }

    /// Gracefully disconnect the client at `client`'s address
    pub fn disconnect_client(&self, client: &PeerSnapshot, reason: u32) -> bool {
        match self.roster.find(client.address()) {
            Some(peer) => {
                debug!(peer = %client.address(), reason, "disconnecting client");
                self.transport.disconnect(&peer, reason);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Snapshot every connected client, oldest connection first.
    ///
    /// Takes one transport statistics read per client under the roster read lock;
    /// avoid calling it per packet on large rosters.
    pub fn connected_clients(&self) -> Vec<PeerSnapshot> {
        self.roster.snapshot_all(|peer| self.transport.snapshot(peer))
    }

    pub fn client_count(&self) -> usize {
        self.roster.len()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn start_listening(&self) -> SessionResult<()> {
        self.event_loop.start()
    }

    /// Stop the loop and wait for the worker to exit. The roster keeps its
    /// members and resumes tracking on the next `start_listening`.
    pub fn stop_listening(&self) -> SessionResult<()> {
        self.event_loop.request_stop()
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    pub fn loop_state(&self) -> LoopState {
        self.event_loop.state()
    }

    pub fn loop_stats(&self) -> LoopStatsSnapshot {
        self.event_loop.stats()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<T: Transport> fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.socket_addr())
            .field("clients", &self.client_count())
            .field("event_loop", &self.event_loop)
            .finish()
    }
}
