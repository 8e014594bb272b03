//! Server-side roster of connected peers
//!
//! The roster is written only by the event loop worker (on connect, disconnect
//! and timeout events) and read from any thread by the send path and by the
//! connected-clients query. Both maps live behind a single lock so readers never
//! see a handle that is in one index but not the other.
//!
//! Several live peers can share an address (a client reconnecting before its old
//! connection timed out, or clients behind one NAT). [`PeerRoster::find`]
//! resolves such collisions to the most recently added peer.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::trace;

use crate::snapshot::PeerSnapshot;

// ----------------------------------------------------------------------------
// Peer Roster
// ----------------------------------------------------------------------------

/// Concurrently readable set of connected peer handles with an address index
#[derive(Debug)]
pub struct PeerRoster<H> {
    inner: RwLock<RosterInner<H>>,
}

#[derive(Debug)]
struct RosterInner<H> {
    members: HashMap<H, Member>,
    /// Handles per address, oldest first
    by_address: HashMap<String, Vec<(u64, H)>>,
    next_order: u64,
}

#[derive(Debug, Clone)]
struct Member {
    address: String,
    order: u64,
}

impl<H: Clone + Eq + Hash> PeerRoster<H> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RosterInner {
                members: HashMap::new(),
                by_address: HashMap::new(),
                next_order: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RosterInner<H>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RosterInner<H>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a connected peer. Returns false if the handle was already present.
    pub fn add(&self, handle: H, address: &str) -> bool {
        let mut inner = self.write();
        if inner.members.contains_key(&handle) {
            return false;
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner
            .by_address
            .entry(address.to_string())
            .or_default()
            .push((order, handle.clone()));
        inner.members.insert(
            handle,
            Member {
                address: address.to_string(),
                order,
            },
        );

        trace!(peer = %address, size = inner.members.len(), "roster add");
        true
    }

    /// Forget a peer. Returns false if the handle was not present.
    pub fn remove(&self, handle: &H) -> bool {
        let mut inner = self.write();
        let Some(member) = inner.members.remove(handle) else {
            return false;
        };

        if let Some(handles) = inner.by_address.get_mut(&member.address) {
            handles.retain(|(_, h)| h != handle);
            if handles.is_empty() {
                inner.by_address.remove(&member.address);
            }
        }

        trace!(peer = %member.address, size = inner.members.len(), "roster remove");
        true
    }

    /// Most recently added live peer with this address
    pub fn find(&self, address: &str) -> Option<H> {
        self.read()
            .by_address
            .get(address)
            .and_then(|handles| handles.last())
            .map(|(_, handle)| handle.clone())
    }

    pub fn contains(&self, handle: &H) -> bool {
        self.read().members.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().members.is_empty()
    }

    /// All handles in connect order
    pub fn handles(&self) -> Vec<H> {
        let inner = self.read();
        ordered(&*inner).into_iter().map(|(handle, _)| handle.clone()).collect()
    }

    /// Snapshot every member in connect order.
    ///
    /// The read lock is held for the whole pass, so the result reflects a single
    /// membership state. Cost grows with the roster size.
    pub fn snapshot_all<F>(&self, mut snapshot: F) -> Vec<PeerSnapshot>
    where
        F: FnMut(&H) -> PeerSnapshot,
    {
        let inner = self.read();
        ordered(&*inner)
            .into_iter()
            .map(|(handle, _)| snapshot(handle))
            .collect()
    }

    /// Drop every member
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.members.clear();
        inner.by_address.clear();
    }
}

fn ordered<H>(inner: &RosterInner<H>) -> Vec<(&H, &Member)> {
    let mut members: Vec<(&H, &Member)> = inner.members.iter().collect();
    members.sort_by_key(|(_, member)| member.order);
    members
}

impl<H: Clone + Eq + Hash> Default for PeerRoster<H> {
    fn default() -> Self {
        Self::new()
    }
}
