//! Typed notifications produced by the event loop
//!
//! One notification is built per transport event and handed to exactly one
//! dispatch call. Client and server endpoints deliver the same shapes so that
//! application code can share its handling logic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::PeerSnapshot;

// ----------------------------------------------------------------------------
// Notification
// ----------------------------------------------------------------------------

/// Connection and data events, each carrying a snapshot of the peer involved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    Connected(PeerSnapshot),
    Disconnected(PeerSnapshot),
    TimedOut(PeerSnapshot),
    /// Payload is an owned copy; the transport buffer is already released
    Received(PeerSnapshot, Vec<u8>),
}

/// Discriminant used to subscribe to a single notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Connected,
    Disconnected,
    TimedOut,
    Received,
}

impl Notification {
    /// Peer the event concerns
    pub fn peer(&self) -> &PeerSnapshot {
        match self {
            Notification::Connected(peer)
            | Notification::Disconnected(peer)
            | Notification::TimedOut(peer)
            | Notification::Received(peer, _) => peer,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Connected(_) => NotificationKind::Connected,
            Notification::Disconnected(_) => NotificationKind::Disconnected,
            Notification::TimedOut(_) => NotificationKind::TimedOut,
            Notification::Received(_, _) => NotificationKind::Received,
        }
    }

    /// Received bytes, if this is a packet notification
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Notification::Received(_, payload) => Some(payload),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Connected => write!(f, "Connected"),
            NotificationKind::Disconnected => write!(f, "Disconnected"),
            NotificationKind::TimedOut => write!(f, "TimedOut"),
            NotificationKind::Received => write!(f, "Received"),
        }
    }
}
