//! Event Loop
//!
//! Background worker that owns the polling side of one transport endpoint.
//!
//! Each poll cycle first asks the transport for an already-queued event without
//! blocking. Only when nothing is queued does the worker block in `service` for up
//! to the configured timeout. An event returned by the blocking wait is dispatched
//! and the worker goes back to non-blocking checks, so everything queued at a given
//! instant is dispatched before the worker blocks again.
//!
//! Raw transport events become [`Notification`]s. The server roster is updated
//! before observers see the notification, and received packet buffers are released
//! before dispatch so an observer panic cannot leak them.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use peerlink_core::{
    LoopConfig, Notification, NotificationKind, PacketBuffer, PeerRoster, SessionError,
    SessionResult, Transport, TransportEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::observers::ObserverRegistry;

// ----------------------------------------------------------------------------
// Loop State
// ----------------------------------------------------------------------------

/// Lifecycle of the polling worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LoopState {
    /// Never started
    Idle = 0,
    Running = 1,
    /// Stop requested; the worker finishes its current event and exits
    StopRequested = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Idle,
            1 => LoopState::Running,
            2 => LoopState::StopRequested,
            _ => LoopState::Stopped,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Running => "running",
            LoopState::StopRequested => "stop-requested",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Loop Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LoopStats {
    connected: AtomicU64,
    disconnected: AtomicU64,
    timed_out: AtomicU64,
    received: AtomicU64,
    checks: AtomicU64,
    blocking_waits: AtomicU64,
    poll_errors: AtomicU64,
    runs_started: AtomicU64,
}

impl LoopStats {
    fn record(&self, kind: NotificationKind) {
        let counter = match kind {
            NotificationKind::Connected => &self.connected,
            NotificationKind::Disconnected => &self.disconnected,
            NotificationKind::TimedOut => &self.timed_out,
            NotificationKind::Received => &self.received,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the worker's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStatsSnapshot {
    pub connected: u64,
    pub disconnected: u64,
    pub timed_out: u64,
    pub received: u64,
    /// Non-blocking `check_events` calls
    pub checks: u64,
    /// Blocking `service` calls
    pub blocking_waits: u64,
    pub poll_errors: u64,
    pub observer_panics: u64,
    /// Times a worker thread was spawned
    pub runs_started: u64,
}

impl LoopStatsSnapshot {
    /// Notifications dispatched across all kinds
    pub fn dispatched(&self) -> u64 {
        self.connected + self.disconnected + self.timed_out + self.received
    }
}

// ----------------------------------------------------------------------------
// Worker Shared State
// ----------------------------------------------------------------------------

struct Shared<T: Transport> {
    transport: Arc<T>,
    observers: Arc<ObserverRegistry>,
    roster: Option<Arc<PeerRoster<T::Peer>>>,
    config: LoopConfig,
    state: AtomicU8,
    stats: LoopStats,
    worker_thread: Mutex<Option<ThreadId>>,
}

impl<T: Transport> Shared<T> {
    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    fn worker_thread(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.worker_thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_worker_thread(&self) -> bool {
        *self.worker_thread() == Some(thread::current().id())
    }

    /// Worker body
    fn run(&self) {
        let _stopped = MarkStoppedOnExit { state: &self.state };
        *self.worker_thread() = Some(thread::current().id());
        let timeout = self.config.poll_timeout();
        info!(thread = %self.config.thread_name, ?timeout, "event loop started");

        while self.is_running() {
            let mut serviced = false;
            while !serviced && self.is_running() {
                LoopStats::bump(&self.stats.checks);
                let queued = match self.transport.check_events() {
                    Ok(event) => event,
                    Err(error) => {
                        trace!(%error, "non-blocking check failed; falling back to service");
                        None
                    }
                };

                let event = match queued {
                    Some(event) => event,
                    None => {
                        LoopStats::bump(&self.stats.blocking_waits);
                        trace!("blocking wait");
                        match self.transport.service(timeout) {
                            Ok(Some(event)) => {
                                serviced = true;
                                event
                            }
                            Ok(None) => break,
                            Err(error) => {
                                LoopStats::bump(&self.stats.poll_errors);
                                warn!(%error, "transport poll failed");
                                break;
                            }
                        }
                    }
                };

                self.handle(event);
            }
        }

        if self.config.flush_on_stop {
            self.transport.flush();
        }
        info!(thread = %self.config.thread_name, "event loop stopped");
    }

    fn handle(&self, event: TransportEvent<T::Peer, T::Packet>) {
        let notification = match event {
            TransportEvent::None => return,
            TransportEvent::Connect { peer, data } => {
                let snapshot = self.transport.snapshot(&peer);
                if let Some(roster) = &self.roster {
                    roster.add(peer, snapshot.address());
                }
                trace!(data, "connect event");
                Notification::Connected(snapshot)
            }
            TransportEvent::Disconnect { peer, data } => {
                let snapshot = self.transport.snapshot(&peer);
                if let Some(roster) = &self.roster {
                    roster.remove(&peer);
                }
                trace!(data, "disconnect event");
                Notification::Disconnected(snapshot)
            }
            TransportEvent::Timeout { peer } => {
                let snapshot = self.transport.snapshot(&peer);
                if let Some(roster) = &self.roster {
                    roster.remove(&peer);
                }
                Notification::TimedOut(snapshot)
            }
            TransportEvent::Receive {
                peer,
                channel,
                packet,
            } => {
                let payload = packet.as_bytes().to_vec();
                drop(packet);
                let snapshot = self.transport.snapshot(&peer);
                trace!(channel, bytes = payload.len(), "receive event");
                Notification::Received(snapshot, payload)
            }
        };

        let kind = notification.kind();
        self.stats.record(kind);
        debug!(%kind, peer = %notification.peer().address(), "dispatching notification");
        self.observers.dispatch(&notification);
    }
}

/// Leaves the loop in `Stopped` however the worker exits
struct MarkStoppedOnExit<'a> {
    state: &'a AtomicU8,
}

impl Drop for MarkStoppedOnExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("event loop worker panicked");
        }
        self.state.store(LoopState::Stopped as u8, Ordering::Release);
    }
}

// ----------------------------------------------------------------------------
// Event Loop
// ----------------------------------------------------------------------------

/// Polling worker for one transport endpoint
pub struct EventLoop<T: Transport> {
    shared: Arc<Shared<T>>,
    /// Worker handle; also serializes start and stop
    control: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> EventLoop<T> {
    pub fn new(transport: Arc<T>, observers: Arc<ObserverRegistry>, config: LoopConfig) -> Self {
        Self::build(transport, observers, None, config)
    }

    /// Loop that keeps `roster` in step with connects and disconnects
    pub fn with_roster(
        transport: Arc<T>,
        observers: Arc<ObserverRegistry>,
        roster: Arc<PeerRoster<T::Peer>>,
        config: LoopConfig,
    ) -> Self {
        Self::build(transport, observers, Some(roster), config)
    }

    fn build(
        transport: Arc<T>,
        observers: Arc<ObserverRegistry>,
        roster: Option<Arc<PeerRoster<T::Peer>>>,
        config: LoopConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                observers,
                roster,
                config,
                state: AtomicU8::new(LoopState::Idle as u8),
                stats: LoopStats::default(),
                worker_thread: Mutex::new(None),
            }),
            control: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> LoopStatsSnapshot {
        let stats = &self.shared.stats;
        LoopStatsSnapshot {
            connected: stats.connected.load(Ordering::Relaxed),
            disconnected: stats.disconnected.load(Ordering::Relaxed),
            timed_out: stats.timed_out.load(Ordering::Relaxed),
            received: stats.received.load(Ordering::Relaxed),
            checks: stats.checks.load(Ordering::Relaxed),
            blocking_waits: stats.blocking_waits.load(Ordering::Relaxed),
            poll_errors: stats.poll_errors.load(Ordering::Relaxed),
            observer_panics: self.shared.observers.panics(),
            runs_started: stats.runs_started.load(Ordering::Relaxed),
        }
    }

    /// Spawn the worker. Does nothing if it is already running.
    pub fn start(&self) -> SessionResult<()> {
        if self.shared.on_worker_thread() {
            return Ok(());
        }
        let mut control = self.control();
        if self.shared.is_running() {
            return Ok(());
        }

        if let Some(previous) = control.take() {
            // Already exited; reap it before spawning the next one
            let _ = previous.join();
        }

        let previous_state = self.shared.state();
        self.shared.set_state(LoopState::Running);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                *control = Some(handle);
                LoopStats::bump(&self.shared.stats.runs_started);
                Ok(())
            }
            Err(error) => {
                self.shared.set_state(previous_state);
                error!(%error, "failed to spawn event loop worker");
                Err(SessionError::WorkerSpawn(error))
            }
        }
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// Returns once the transport has been flushed and no further notification can
    /// fire. Does nothing if the worker is not running. Must not be called from an
    /// observer: the worker cannot join itself, so that returns
    /// [`SessionError::StopFromWorker`].
    pub fn request_stop(&self) -> SessionResult<()> {
        if self.shared.on_worker_thread() {
            return Err(SessionError::StopFromWorker);
        }
        let mut control = self.control();
        if !self.shared.is_running() {
            return Ok(());
        }

        debug!("stop requested");
        self.shared.set_state(LoopState::StopRequested);
        if let Some(handle) = control.take() {
            if handle.join().is_err() {
                warn!("event loop worker exited by panic");
            }
        }
        *self.shared.worker_thread() = None;
        self.shared.set_state(LoopState::Stopped);
        Ok(())
    }

    fn control(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for EventLoop<T> {
    fn drop(&mut self) {
        if let Err(SessionError::StopFromWorker) = self.request_stop() {
            // Dropped by one of its own observers; let the worker wind down alone
            self.shared.set_state(LoopState::StopRequested);
        }
    }
}

impl<T: Transport> fmt::Debug for EventLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("state", &self.state())
            .field("thread_name", &self.shared.config.thread_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_harness::ScriptedTransport;
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    fn scripted_loop() -> (Arc<ScriptedTransport>, Arc<ObserverRegistry>, EventLoop<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new());
        let observers = Arc::new(ObserverRegistry::new());
        let event_loop = EventLoop::new(transport.clone(), observers.clone(), LoopConfig::testing());
        (transport, observers, event_loop)
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn state_transitions() {
        let (_transport, _observers, event_loop) = scripted_loop();
        assert_eq!(event_loop.state(), LoopState::Idle);

        event_loop.start().unwrap();
        assert_eq!(event_loop.state(), LoopState::Running);

        event_loop.request_stop().unwrap();
        assert_eq!(event_loop.state(), LoopState::Stopped);
    }

    #[test]
    fn roster_is_updated_before_dispatch() {
        let transport = Arc::new(ScriptedTransport::new());
        let observers = Arc::new(ObserverRegistry::new());
        let roster = Arc::new(PeerRoster::new());
        let event_loop = EventLoop::with_roster(
            transport.clone(),
            observers.clone(),
            roster.clone(),
            LoopConfig::testing(),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let roster = roster.clone();
            let seen = seen.clone();
            observers.subscribe(move |notification| {
                seen.lock().unwrap().push((notification.kind(), roster.len()));
            });
        }

        let address: SocketAddr = "10.1.1.1:4000".parse().unwrap();
        transport.queue_connect(1, address);
        transport.queue_disconnect(1, 0);
        event_loop.start().unwrap();
        assert!(wait_for(|| seen.lock().unwrap().len() == 2));
        event_loop.request_stop().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(NotificationKind::Connected, 1), (NotificationKind::Disconnected, 0)]
        );
    }

    #[test]
    fn dropping_a_running_loop_stops_it() {
        let (transport, _observers, event_loop) = scripted_loop();
        event_loop.start().unwrap();
        drop(event_loop);
        assert_eq!(transport.flushes(), 1);
    }
}
