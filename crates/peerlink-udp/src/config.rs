//! UDP Transport Configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Socket and session timing for every endpoint a [`crate::UdpProvider`] creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Interface client endpoints bind to (on an ephemeral port)
    pub client_bind_address: IpAddr,
    /// How long a connect may wait for the remote hello before it times out
    pub connect_timeout_ms: u64,
    /// Silence after which laminar drops a connection
    pub idle_timeout_ms: u64,
    /// Keep-alive interval for quiet connections; 0 disables heartbeats
    pub heartbeat_interval_ms: u64,
    /// Largest accepted payload
    pub max_payload_size: usize,
    /// Sleep between socket polls while `service` waits
    pub service_step_ms: u64,
    /// Closed peers kept after their final event was polled
    pub retained_closed_peers: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            client_bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            max_payload_size: 8 * 1024,
            service_step_ms: 1,
            retained_closed_peers: 64,
        }
    }
}

impl UdpConfig {
    /// Loopback-only binding and short timeouts for tests
    pub fn testing() -> Self {
        Self {
            client_bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_timeout_ms: 300,
            idle_timeout_ms: 2_000,
            heartbeat_interval_ms: 200,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn service_step(&self) -> Duration {
        Duration::from_millis(self.service_step_ms.max(1))
    }

    pub(crate) fn laminar_config(&self) -> laminar::Config {
        laminar::Config {
            idle_connection_timeout: Duration::from_millis(self.idle_timeout_ms),
            heartbeat_interval: (self.heartbeat_interval_ms > 0)
                .then(|| Duration::from_millis(self.heartbeat_interval_ms)),
            ..laminar::Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_heartbeat_disables_keep_alive() {
        let config = UdpConfig {
            heartbeat_interval_ms: 0,
            ..UdpConfig::default()
        };
        assert_eq!(config.laminar_config().heartbeat_interval, None);
        assert_eq!(
            UdpConfig::testing().laminar_config().heartbeat_interval,
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn service_step_never_spins() {
        let config = UdpConfig {
            service_step_ms: 0,
            ..UdpConfig::default()
        };
        assert_eq!(config.service_step(), Duration::from_millis(1));
    }
}
