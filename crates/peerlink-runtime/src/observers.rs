//! Observer Registry
//!
//! Holds the callbacks an endpoint re-exposes to its host and dispatches each
//! notification to them. Dispatch happens synchronously on the event loop worker,
//! in registration order; a slow observer delays every later event.
//!
//! The observer list is copied under a read lock and the lock released before any
//! callback runs, so callbacks may subscribe or unsubscribe freely. Every callback
//! is isolated with `catch_unwind`: a panicking observer is logged and counted, and
//! dispatch continues with the next one.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use peerlink_core::{Notification, NotificationKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::stream::NotificationStream;

// ----------------------------------------------------------------------------
// Subscription Identifiers
// ----------------------------------------------------------------------------

/// Handle returned by every registration, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<Notification>),
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    filter: Option<NotificationKind>,
    sink: Sink,
}

impl Subscription {
    fn wants(&self, kind: NotificationKind) -> bool {
        self.filter.map_or(true, |filter| filter == kind)
    }
}

/// Callbacks registered against an endpoint's notifications
#[derive(Default)]
pub struct ObserverRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
    panics: AtomicU64,
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("subscriptions", &self.len())
            .field("panics", &self.panics())
            .finish()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe every notification kind
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(None, Sink::Callback(Arc::new(observer)))
    }

    /// Observe a single notification kind
    pub fn subscribe_kind<F>(&self, kind: NotificationKind, observer: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(Some(kind), Sink::Callback(Arc::new(observer)))
    }

    pub fn on_connected<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_kind(NotificationKind::Connected, observer)
    }

    pub fn on_disconnected<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_kind(NotificationKind::Disconnected, observer)
    }

    pub fn on_timed_out<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_kind(NotificationKind::TimedOut, observer)
    }

    pub fn on_received<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_kind(NotificationKind::Received, observer)
    }

    /// Forward every notification into an async stream.
    ///
    /// The subscription is dropped at the first dispatch after the stream is.
    pub fn stream(&self) -> NotificationStream {
        self.open_stream(None)
    }

    /// Forward one notification kind into an async stream
    pub fn stream_kind(&self, kind: NotificationKind) -> NotificationStream {
        self.open_stream(Some(kind))
    }

    fn open_stream(&self, filter: Option<NotificationKind>) -> NotificationStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.register(filter, Sink::Channel(sender));
        NotificationStream::new(id, receiver)
    }

    /// Remove a registration; false if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        before != subscriptions.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Observer invocations that panicked
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Deliver `notification` to every matching observer, in registration order.
    ///
    /// Returns the number of observers that ran to completion.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        let kind = notification.kind();
        let matching: Vec<Subscription> = self
            .read()
            .iter()
            .filter(|subscription| subscription.wants(kind))
            .cloned()
            .collect();

        let mut completed = 0;
        let mut closed = Vec::new();
        for subscription in matching {
            match &subscription.sink {
                Sink::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                        Ok(()) => completed += 1,
                        Err(payload) => {
                            self.panics.fetch_add(1, Ordering::Relaxed);
                            error!(
                                subscription = %subscription.id,
                                %kind,
                                panic = %panic_message(payload.as_ref()),
                                "observer panicked"
                            );
                        }
                    }
                }
                Sink::Channel(sender) => {
                    if sender.send(notification.clone()).is_ok() {
                        completed += 1;
                    } else {
                        closed.push(subscription.id);
                    }
                }
            }
        }

        for id in closed {
            debug!(subscription = %id, "notification stream dropped; unsubscribing");
            self.unsubscribe(id);
        }
        completed
    }

    fn register(&self, filter: Option<NotificationKind>, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId::generate();
        self.write().push(Subscription { id, filter, sink });
        debug!(subscription = %id, ?filter, "observer registered");
        id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Subscription>> {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
