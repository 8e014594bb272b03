//! peerlink Runtime
//!
//! The polling engine and the endpoints built on it:
//! - `EventLoop`: background worker that drains a transport and dispatches notifications
//! - `ObserverRegistry`: callback registration and isolated, ordered dispatch
//! - `Client` and `Server`: single-peer and roster-backed session endpoints
//! - `NotificationStream`: async adaptor over the observer registry
//!
//! `peerlink-core` provides the types and the transport contract these are built on.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod endpoint;
pub mod event_loop;
pub mod observers;
pub mod stream;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use endpoint::{Client, Server};
pub use event_loop::{EventLoop, LoopState, LoopStatsSnapshot};
pub use observers::{ObserverRegistry, SubscriptionId};
pub use stream::NotificationStream;

// Re-export core types for convenience
pub use peerlink_core::{
    ClientConfig, ConfigError, ConnectionState, LoopConfig, Notification, NotificationKind,
    PeerAddress, PeerSnapshot, SendError, ServerConfig, SessionError, SessionResult, Transport,
    TransportError, TransportProvider,
};
