//! Error types for peerlink
//!
//! Errors are split by where they surface. Configuration errors fail the call
//! that introduced them, transport errors come from the collaborator and are
//! mostly absorbed by the event loop, and send errors are only exposed through
//! `try_send`; the plain `send` APIs collapse them into `false`.

use std::net::SocketAddr;

use crate::types::ConnectionState;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Invalid arguments detected before anything touches the transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port: {port}")]
    InvalidPort { port: u16 },
    #[error("Invalid peer limit: {requested} (allowed 1..={max})")]
    InvalidMaxPeers { requested: usize, max: usize },
    #[error("Malformed address '{input}': {reason}")]
    MalformedAddress { input: String, reason: String },
    #[error("Invalid channel limit: {limit} (allowed 1..={max})")]
    InvalidChannelLimit { limit: usize, max: usize },
    #[error("Default channel {channel} is outside the channel limit {limit}")]
    InvalidDefaultChannel { channel: u8, limit: u8 },
    #[error("Invalid poll timeout: {timeout_ms}ms")]
    InvalidPollTimeout { timeout_ms: u64 },
}

/// Failures reported by the transport collaborator
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: SocketAddr, reason: String },
    #[error("Address already in use: {address}")]
    AddressInUse { address: SocketAddr },
    #[error("Poll failed with code {code}")]
    Poll { code: i32 },
    #[error("Connection to {address} refused: {reason}")]
    ConnectRefused { address: SocketAddr, reason: String },
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport endpoint is closed")]
    Closed,
}

/// Reasons a single packet could not be queued
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Peer is not connected (state: {state})")]
    NotConnected { state: ConnectionState },
    #[error("Outbound queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },
    #[error("Channel {channel} is outside the negotiated limit {limit}")]
    InvalidChannel { channel: u8, limit: u8 },
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("No live peer matches the target")]
    NoPeer,
    #[error("Transport rejected the packet: {reason}")]
    Rejected { reason: String },
}

// ----------------------------------------------------------------------------
// Session Error
// ----------------------------------------------------------------------------

/// Top-level error returned by endpoint constructors and lifecycle calls
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to spawn event loop worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// Stopping a loop from one of its own observers would join the current thread
    #[error("request_stop called from the event loop worker thread")]
    StopFromWorker,
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl ConfigError {
    /// Create a malformed address error
    pub fn malformed_address<I: Into<String>, R: Into<String>>(input: I, reason: R) -> Self {
        ConfigError::MalformedAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

impl TransportError {
    /// Create a bind failure for the given address
    pub fn bind<R: Into<String>>(address: SocketAddr, reason: R) -> Self {
        TransportError::Bind {
            address,
            reason: reason.into(),
        }
    }

    /// Create a refused connection error
    pub fn connect_refused<R: Into<String>>(address: SocketAddr, reason: R) -> Self {
        TransportError::ConnectRefused {
            address,
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type SessionResult<T> = std::result::Result<T, SessionError>;
