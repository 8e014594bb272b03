//! Property-based tests for the peer roster
//!
//! These tests verify that the roster behaves like a simple ordered model under
//! arbitrary connect/disconnect sequences, and that readers running concurrently
//! with the writer only ever observe fully applied membership states.

use peerlink_core::{ConnectionState, PeerRoster, PeerSnapshot};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

// ----------------------------------------------------------------------------
// Strategies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RosterOp {
    Connect { handle: u16, address: u8 },
    Disconnect { handle: u16 },
}

/// Small handle and address spaces so reconnects and shared addresses are common
fn arb_op() -> impl Strategy<Value = RosterOp> {
    prop_oneof![
        3 => (0u16..24, 0u8..4).prop_map(|(handle, address)| RosterOp::Connect { handle, address }),
        2 => (0u16..24).prop_map(|handle| RosterOp::Disconnect { handle }),
    ]
}

fn address_of(index: u8) -> String {
    format!("10.0.0.{}", index)
}

/// Sequential model: connected handles with their address, oldest first
#[derive(Debug, Default, Clone)]
struct Model {
    members: Vec<(u16, String)>,
}

impl Model {
    fn apply(&mut self, op: &RosterOp) -> bool {
        match op {
            RosterOp::Connect { handle, address } => {
                if self.members.iter().any(|(h, _)| h == handle) {
                    return false;
                }
                self.members.push((*handle, address_of(*address)));
                true
            }
            RosterOp::Disconnect { handle } => {
                let before = self.members.len();
                self.members.retain(|(h, _)| h != handle);
                before != self.members.len()
            }
        }
    }

    fn find(&self, address: &str) -> Option<u16> {
        self.members
            .iter()
            .rev()
            .find(|(_, a)| a == address)
            .map(|(h, _)| *h)
    }

    fn handle_set(&self) -> BTreeSet<u16> {
        self.members.iter().map(|(h, _)| *h).collect()
    }
}

/// Per-address `find` result for every address the strategies generate
fn find_results(model: &Model) -> Vec<Option<u16>> {
    (0..4u8).map(|index| model.find(&address_of(index))).collect()
}

fn apply(roster: &PeerRoster<u16>, op: &RosterOp) -> bool {
    match op {
        RosterOp::Connect { handle, address } => roster.add(*handle, &address_of(*address)),
        RosterOp::Disconnect { handle } => roster.remove(handle),
    }
}

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

proptest! {
    /// Property: the roster agrees with the sequential model after every operation
    #[test]
    fn roster_matches_sequential_model(ops in prop::collection::vec(arb_op(), 1..80)) {
        init_logging();
        let roster = PeerRoster::new();
        let mut model = Model::default();

        for op in &ops {
            prop_assert_eq!(apply(&roster, op), model.apply(op));

            let expected: Vec<u16> = model.members.iter().map(|(h, _)| *h).collect();
            prop_assert_eq!(roster.handles(), expected);
            prop_assert_eq!(roster.len(), model.members.len());

            for index in 0..4u8 {
                let address = address_of(index);
                prop_assert_eq!(roster.find(&address), model.find(&address));
            }
        }
    }

    /// Property: concurrent readers only observe membership states the writer
    /// actually passed through, never a partially applied add or remove, and
    /// `find` only ever resolves an address to a handle some such state held
    #[test]
    fn concurrent_readers_observe_consistent_states(
        ops in prop::collection::vec(arb_op(), 1..60)
    ) {
        init_logging();
        let mut model = Model::default();
        let mut valid_states = vec![model.handle_set()];
        let mut valid_finds = vec![find_results(&model)];
        for op in &ops {
            model.apply(op);
            valid_states.push(model.handle_set());
            valid_finds.push(find_results(&model));
        }
        let valid_states = Arc::new(valid_states);
        let valid_finds = Arc::new(valid_finds);

        let roster: Arc<PeerRoster<u16>> = Arc::new(PeerRoster::new());
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|reader| {
                let roster = roster.clone();
                let done = done.clone();
                let valid_states = valid_states.clone();
                let valid_finds = valid_finds.clone();
                thread::spawn(move || {
                    let mut observations = 0usize;
                    loop {
                        let finished = done.load(Ordering::Acquire);

                        let snapshots = roster.snapshot_all(|handle| {
                            PeerSnapshot::new(handle.to_string(), 0, ConnectionState::Connected)
                        });
                        let seen: BTreeSet<u16> = snapshots
                            .iter()
                            .map(|s| s.address().parse::<u16>().unwrap())
                            .collect();
                        assert_eq!(seen.len(), snapshots.len(), "duplicate handle in snapshot");
                        assert!(
                            valid_states.contains(&seen),
                            "reader {} observed a state the writer never produced: {:?}",
                            reader,
                            seen
                        );

                        let handles: BTreeSet<u16> = roster.handles().into_iter().collect();
                        assert!(valid_states.contains(&handles));

                        for index in 0..4u8 {
                            let found = roster.find(&address_of(index));
                            assert!(
                                valid_finds.iter().any(|finds| finds[index as usize] == found),
                                "reader {} resolved {} to {:?}, which no state maps it to",
                                reader,
                                address_of(index),
                                found
                            );
                        }

                        observations += 1;
                        if finished {
                            return observations;
                        }
                    }
                })
            })
            .collect();

        for op in &ops {
            apply(&roster, op);
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            let observations = reader.join().expect("reader thread panicked");
            prop_assert!(observations > 0);
        }
        prop_assert_eq!(roster.handles().into_iter().collect::<BTreeSet<_>>(), model.handle_set());
    }
}
