//! Session endpoints
//!
//! Two configurations of the same façade over an [`EventLoop`](crate::EventLoop):
//! a [`Client`] bound to at most one server peer, and a [`Server`] that tracks its
//! connected clients in a [`PeerRoster`](peerlink_core::PeerRoster). Both re-expose
//! the loop's notifications through an [`ObserverRegistry`](crate::ObserverRegistry)
//! with identical payloads, so handling code can be shared between them.

pub mod client;
pub mod server;

pub use client::Client;
pub use server::Server;
