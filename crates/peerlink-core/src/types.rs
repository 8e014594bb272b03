//! Core types for peerlink
//!
//! Connection lifecycle as reported by the transport, and the validated remote
//! address a client connects to.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Transport-reported lifecycle of a single peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Uninitialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Connection is gone but the transport has not yet reclaimed the slot
    Zombie,
}

impl ConnectionState {
    /// Whether the handshake has completed and the peer has not started leaving
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the transport will accept outbound packets for the peer
    pub fn can_send(&self) -> bool {
        self.is_connected()
    }

    /// Whether the peer has left or is about to leave
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnecting | ConnectionState::Disconnected | ConnectionState::Zombie
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Zombie => "zombie",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Peer Address
// ----------------------------------------------------------------------------

const MAX_HOSTNAME_LEN: usize = 253;

/// A validated remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    /// Parse a host name or textual IP plus port.
    ///
    /// IP literals never touch the resolver. Host names are checked syntactically
    /// first and then resolved, preferring an IPv4 result.
    pub fn parse(host_or_address: &str, port: u16) -> Result<Self, ConfigError> {
        let host = host_or_address.trim();
        if host.is_empty() {
            return Err(ConfigError::malformed_address(host_or_address, "empty host"));
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort { port });
        }

        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(Self(SocketAddr::new(ip, port)));
        }

        validate_hostname(host)
            .map_err(|reason| ConfigError::malformed_address(host_or_address, reason))?;

        let resolved: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::malformed_address(host_or_address, e.to_string()))?
            .collect();

        resolved
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| resolved.first())
            .copied()
            .map(Self)
            .ok_or_else(|| ConfigError::malformed_address(host_or_address, "host did not resolve"))
    }

    /// Wrap an already-resolved socket address
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Textual IP, the form peers are looked up by
    pub fn ip_string(&self) -> String {
        self.0.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

fn validate_hostname(host: &str) -> Result<(), &'static str> {
    if host.len() > MAX_HOSTNAME_LEN {
        return Err("host name too long");
    }
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err("invalid host name label");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("host name label may not start or end with '-'");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err("host name contains invalid characters");
        }
    }
    Ok(())
}
