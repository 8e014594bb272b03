//! Endpoint Configuration
//!
//! Serializable configuration for the event loop and for both endpoint
//! configurations, with defaults and a few named presets. Hosts typically embed
//! these structs in their own configuration files.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Blocking wait used by the poll cycle when nothing is queued
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 5;

/// Largest number of peers one endpoint can address
pub const MAX_PEERS: usize = 4095;

/// Largest number of channels one connection can negotiate
pub const MAX_CHANNELS: usize = 255;

/// Upper bound on the poll timeout; longer waits make `request_stop` sluggish
const MAX_POLL_TIMEOUT_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Event Loop Configuration
// ----------------------------------------------------------------------------

/// Configuration for the polling worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Timeout of the blocking wait, in milliseconds
    pub poll_timeout_ms: u64,
    /// Name given to the worker thread
    pub thread_name: String,
    /// Flush the transport when the worker exits
    pub flush_on_stop: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            thread_name: "peerlink-loop".to_string(),
            flush_on_stop: true,
        }
    }
}

impl LoopConfig {
    /// Short waits so tests observe events and stops quickly
    pub fn testing() -> Self {
        Self {
            poll_timeout_ms: 1,
            thread_name: "peerlink-test-loop".to_string(),
            flush_on_stop: true,
        }
    }

    /// Minimal blocking for latency-sensitive hosts, at some CPU cost
    pub fn low_latency() -> Self {
        Self {
            poll_timeout_ms: 1,
            ..Self::default()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout_ms == 0 || self.poll_timeout_ms > MAX_POLL_TIMEOUT_MS {
            return Err(ConfigError::InvalidPollTimeout {
                timeout_ms: self.poll_timeout_ms,
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Configuration for a single-peer client endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Channels requested when connecting
    pub channel_limit: u8,
    /// Channel used by `send`
    pub default_channel: u8,
    pub event_loop: LoopConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_limit: 1,
            default_channel: 0,
            event_loop: LoopConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn testing() -> Self {
        Self {
            event_loop: LoopConfig::testing(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_channels(self.channel_limit, self.default_channel)?;
        self.event_loop.validate()
    }
}

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Configuration for a multi-peer server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local interface to bind
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Listening port
    pub port: u16,
    /// Maximum simultaneous clients
    pub max_clients: usize,
    #[serde(default = "default_channel_limit")]
    pub channel_limit: u8,
    #[serde(default)]
    pub default_channel: u8,
    #[serde(default)]
    pub event_loop: LoopConfig,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_channel_limit() -> u8 {
    1
}

impl ServerConfig {
    /// Listen on every interface at `port`
    pub fn new(port: u16, max_clients: usize) -> Self {
        Self {
            bind_address: default_bind_address(),
            port,
            max_clients,
            channel_limit: default_channel_limit(),
            default_channel: 0,
            event_loop: LoopConfig::default(),
        }
    }

    pub fn testing(port: u16, max_clients: usize) -> Self {
        Self {
            event_loop: LoopConfig::testing(),
            ..Self::new(port, max_clients)
        }
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort { port: self.port });
        }
        if self.max_clients == 0 || self.max_clients > MAX_PEERS {
            return Err(ConfigError::InvalidMaxPeers {
                requested: self.max_clients,
                max: MAX_PEERS,
            });
        }
        validate_channels(self.channel_limit, self.default_channel)?;
        self.event_loop.validate()
    }
}

fn validate_channels(channel_limit: u8, default_channel: u8) -> Result<(), ConfigError> {
    if channel_limit == 0 {
        return Err(ConfigError::InvalidChannelLimit {
            limit: channel_limit as usize,
            max: MAX_CHANNELS,
        });
    }
    if default_channel >= channel_limit {
        return Err(ConfigError::InvalidDefaultChannel {
            channel: default_channel,
            limit: channel_limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(LoopConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ServerConfig::new(7777, 4).validate().is_ok());
        assert_eq!(LoopConfig::default().poll_timeout(), Duration::from_millis(5));
    }

    #[test]
    fn server_rejects_bad_port_and_peer_limits() {
        assert_eq!(
            ServerConfig::new(0, 4).validate(),
            Err(ConfigError::InvalidPort { port: 0 })
        );
        assert_eq!(
            ServerConfig::new(7777, 0).validate(),
            Err(ConfigError::InvalidMaxPeers {
                requested: 0,
                max: MAX_PEERS
            })
        );
        assert!(ServerConfig::new(7777, MAX_PEERS + 1).validate().is_err());
        assert!(ServerConfig::new(7777, MAX_PEERS).validate().is_ok());
    }

    #[test]
    fn default_channel_must_fit_channel_limit() {
        let config = ClientConfig {
            channel_limit: 2,
            default_channel: 2,
            ..ClientConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDefaultChannel {
                channel: 2,
                limit: 2
            })
        );
    }

    #[test]
    fn poll_timeout_bounds() {
        let mut config = LoopConfig::default();
        config.poll_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.poll_timeout_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_config_fills_defaults_when_deserialized() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "port": 9000, "max_clients": 16 }"#).unwrap();
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:9000");
        assert_eq!(config.channel_limit, 1);
        assert_eq!(config.event_loop, LoopConfig::default());
        assert!(config.validate().is_ok());
    }
}
