//! peerlink Core
//!
//! Leaf types shared by the peerlink session loop: immutable peer snapshots,
//! typed notifications, the contract consumed from the underlying reliable-UDP
//! transport, the server-side peer roster, configuration and the error taxonomy.
//!
//! Nothing in this crate performs I/O or spawns threads. The polling engine and
//! the client/server endpoints live in `peerlink-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod notification;
pub mod roster;
pub mod snapshot;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ClientConfig, LoopConfig, ServerConfig, DEFAULT_POLL_TIMEOUT_MS, MAX_CHANNELS, MAX_PEERS,
};
pub use errors::{ConfigError, SendError, SessionError, SessionResult, TransportError};
pub use notification::{Notification, NotificationKind};
pub use roster::PeerRoster;
pub use snapshot::PeerSnapshot;
pub use transport::{PacketBuffer, Transport, TransportEvent, TransportProvider};
pub use types::{ConnectionState, PeerAddress};
