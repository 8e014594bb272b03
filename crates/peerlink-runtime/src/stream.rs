//! Notification Stream
//!
//! Async view of an endpoint's notifications for hosts running on tokio. The
//! event loop worker stays a plain thread; notifications cross over through an
//! unbounded `tokio::sync::mpsc` channel, so a slow consumer never stalls polling.

use peerlink_core::Notification;
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::observers::SubscriptionId;

/// Receiving half of a registry subscription created by
/// [`ObserverRegistry::stream`](crate::ObserverRegistry::stream)
#[derive(Debug)]
pub struct NotificationStream {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationStream {
    pub(crate) fn new(id: SubscriptionId, receiver: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self { id, receiver }
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next notification; `None` once the registry is gone
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// Take an already-delivered notification without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        match self.receiver.try_recv() {
            Ok(notification) => Some(notification),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking receive for non-async callers. Panics if called inside a tokio runtime.
    pub fn blocking_recv(&mut self) -> Option<Notification> {
        self.receiver.blocking_recv()
    }
}
