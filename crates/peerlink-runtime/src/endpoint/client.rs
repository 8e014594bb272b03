//! Client Endpoint
//!
//! Single-peer endpoint: one unbound transport endpoint, at most one bound server
//! peer, and an event loop without a roster.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerlink_core::{
    ClientConfig, PeerAddress, PeerSnapshot, SendError, SessionResult, Transport,
    TransportProvider,
};
use tracing::{debug, info};

use crate::event_loop::{EventLoop, LoopState, LoopStatsSnapshot};
use crate::observers::ObserverRegistry;

/// Endpoint that connects out to a single server
pub struct Client<T: Transport> {
    transport: Arc<T>,
    observers: Arc<ObserverRegistry>,
    event_loop: EventLoop<T>,
    server: Mutex<Option<T::Peer>>,
    config: ClientConfig,
}

impl<T: Transport> Client<T> {
    /// Create a client with the default configuration
    pub fn new<P>(provider: &P) -> SessionResult<Self>
    where
        P: TransportProvider<Transport = T>,
    {
        Self::with_config(provider, ClientConfig::default())
    }

    pub fn with_config<P>(provider: &P, config: ClientConfig) -> SessionResult<Self>
    where
        P: TransportProvider<Transport = T>,
    {
        config.validate()?;
        let transport = Arc::new(provider.create_endpoint()?);
        let observers = Arc::new(ObserverRegistry::new());
        let event_loop = EventLoop::new(
            transport.clone(),
            observers.clone(),
            config.event_loop.clone(),
        );

        Ok(Self {
            transport,
            observers,
            event_loop,
            server: Mutex::new(None),
            config,
        })
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Start connecting to `host_or_address:port`.
    ///
    /// Returns once the transport has accepted the attempt; the outcome arrives as a
    /// connected, disconnected or timed-out notification once the loop is running.
    /// A previously bound peer is disconnected and replaced.
    pub fn connect(&self, host_or_address: &str, port: u16) -> SessionResult<()> {
        let address = PeerAddress::parse(host_or_address, port)?;
        let peer = self
            .transport
            .connect(address.socket_addr(), self.config.channel_limit)?;
        info!(server = %address, "client connect initiated");

        if let Some(previous) = self.server().replace(peer) {
            debug!(?previous, "replacing bound server peer");
            self.transport.disconnect(&previous, 0);
        }
        Ok(())
    }

    /// Gracefully disconnect from the server, passing `reason` to the remote side.
    /// Does nothing if `connect` was never called.
    pub fn disconnect(&self, reason: u32) {
        if let Some(peer) = self.server().as_ref() {
            debug!(reason, "client disconnecting");
            self.transport.disconnect(peer, reason);
        }
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send on the default channel; false if the packet was not queued
    pub fn send(&self, payload: &[u8]) -> bool {
        self.send_on(self.config.default_channel, payload)
    }

    pub fn send_on(&self, channel: u8, payload: &[u8]) -> bool {
        match self.try_send(channel, payload) {
            Ok(()) => true,
            Err(error) => {
                debug!(%error, channel, bytes = payload.len(), "client send rejected");
                false
            }
        }
    }

    /// Send and report why the packet was not queued
    pub fn try_send(&self, channel: u8, payload: &[u8]) -> Result<(), SendError> {
        let peer = self.server().clone().ok_or(SendError::NoPeer)?;
        self.transport.send(&peer, channel, payload)
    }

    // ------------------------------------------------------------------------
    // Lifecycle and Queries
    // ------------------------------------------------------------------------

    pub fn start_listening(&self) -> SessionResult<()> {
        self.event_loop.start()
    }

    /// Stop the loop and wait for the worker to exit
    pub fn stop_listening(&self) -> SessionResult<()> {
        self.event_loop.request_stop()
    }

    /// Fresh snapshot of the bound server peer, if any
    pub fn server_peer(&self) -> Option<PeerSnapshot> {
        let peer = self.server().clone()?;
        Some(self.transport.snapshot(&peer))
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

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn server(&self) -> MutexGuard<'_, Option<T::Peer>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("server", &*self.server())
            .field("event_loop", &self.event_loop)
            .finish()
    }
}
