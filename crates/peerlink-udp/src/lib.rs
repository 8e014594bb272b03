//! peerlink UDP
//!
//! Socket-backed transport for the peerlink session loop. Endpoints wrap a
//! laminar reliable-UDP socket, which handles acknowledgements, retransmission,
//! ordering and heartbeats; this crate adds session handshakes, graceful
//! goodbyes and per-session statistics on top.
//!
//! ```no_run
//! use peerlink_udp::UdpProvider;
//! use peerlink_runtime::{Client, ClientConfig};
//!
//! let client = Client::with_config(&UdpProvider::new(), ClientConfig::default()).unwrap();
//! client.start_listening().unwrap();
//! client.connect("127.0.0.1", 9000).unwrap();
//! ```

pub mod config;
pub mod frame;
pub mod transport;

pub use config::UdpConfig;
pub use transport::{UdpHost, UdpPeer, UdpProvider};
