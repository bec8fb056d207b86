// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Shared transaction state.
//!
//! Four objects are globally visible and mutated by multiple actors: the
//! transaction record, one provisional write (intent) per key, one
//! timestamp-cache entry per key, and the one-shot client commit
//! acknowledgment. Every protocol step sees a consistent view of the
//! objects it touches and commits its mutation indivisibly.
//!
//! # Locking discipline
//!
//! The record has its own mutex; the intent and timestamp-cache entry for a
//! key share one per-key mutex. A step touching a single key locks only
//! that key's slot. A step that names the record together with intents
//! locks the record first and then every slot in ascending key order, so
//! lock acquisition follows one total order and cannot deadlock.

mod ack;
mod error;
mod intent;
mod key;
mod record;

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

pub use ack::CommitAck;
pub use error::StateError;
pub use intent::{Intent, KeySlot};
pub use key::{Key, WriteSet};
pub use record::{TxnRecord, TxnStatus};

/// The shared mutable state of one transaction.
///
/// This is the in-memory stand-in for the record and intent storage of a
/// real deployment: each object is linearizable on its own, and all access
/// goes through step operations that serialize on the objects they touch.
/// Actors share it through an [`Arc`](std::sync::Arc).
#[derive(Debug)]
pub struct SharedTxnState {
    record: Mutex<TxnRecord>,
    slots: BTreeMap<Key, Mutex<KeySlot>>,
    ack: CommitAck,
}

impl SharedTxnState {
    /// Creates fresh state for a transaction with the given write set: a
    /// pending record, an empty slot per key, and an unset acknowledgment.
    pub fn new(writes: &WriteSet) -> Self {
        let slots = writes
            .keys()
            .into_iter()
            .map(|key| (key, Mutex::new(KeySlot::default())))
            .collect();
        Self {
            record: Mutex::new(TxnRecord::new()),
            slots,
            ack: CommitAck::new(),
        }
    }

    /// Returns the transaction's keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.slots.keys()
    }

    /// Returns true once the committer has acknowledged the client.
    #[inline]
    pub fn commit_acked(&self) -> bool {
        self.ack.is_set()
    }

    /// Models an external reader at `ts`: after this call, no write at or
    /// below `ts` may succeed at `key`.
    pub fn observe_read(&self, key: &Key, ts: u64) {
        let floor = self.key_step(key, |slot| slot.bump_tscache(ts));
        trace!(?key, ts, floor, "read observed; timestamp cache advanced");
    }

    /// Takes a consistent snapshot of every shared object.
    pub fn snapshot(&self) -> StateSnapshot {
        self.global_step(|view| StateSnapshot {
            record: *view.record(),
            commit_ack: view.ack().is_set(),
            implicit_commit: view.implicit_commit(),
            keys: view
                .slots
                .iter()
                .map(|(key, slot)| {
                    (
                        (*key).clone(),
                        KeyObservation {
                            intent: slot.intent(),
                            tscache: slot.tscache(),
                        },
                    )
                })
                .collect(),
        })
    }

    fn slot(&self, key: &Key) -> &Mutex<KeySlot> {
        self.slots
            .get(key)
            .unwrap_or_else(|| panic!("key {key:?} is not in the transaction write set"))
    }

    /// Runs one step against a single key's slot.
    pub(crate) fn key_step<R>(&self, key: &Key, f: impl FnOnce(&mut KeySlot) -> R) -> R {
        let mut slot = self.slot(key).lock();
        f(&mut slot)
    }

    /// Runs one step against the record alone.
    pub(crate) fn record_step<R>(&self, f: impl FnOnce(&mut TxnRecord) -> R) -> R {
        let mut record = self.record.lock();
        f(&mut record)
    }

    /// Runs one step against the record and every slot together. Locks are
    /// acquired record first, then slots in ascending key order.
    pub(crate) fn global_step<R>(&self, f: impl FnOnce(&mut GlobalView<'_>) -> R) -> R {
        let mut view = GlobalView {
            record: self.record.lock(),
            slots: self
                .slots
                .iter()
                .map(|(key, slot)| (key, slot.lock()))
                .collect(),
            ack: &self.ack,
        };
        f(&mut view)
    }
}

/// A fully locked view of the shared state, handed to multi-object steps.
pub(crate) struct GlobalView<'a> {
    record: MutexGuard<'a, TxnRecord>,
    slots: Vec<(&'a Key, MutexGuard<'a, KeySlot>)>,
    ack: &'a CommitAck,
}

impl GlobalView<'_> {
    pub(crate) fn record(&self) -> &TxnRecord {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut TxnRecord {
        &mut self.record
    }

    pub(crate) fn ack(&self) -> &CommitAck {
        self.ack
    }

    pub(crate) fn slot(&self, key: &Key) -> &KeySlot {
        let idx = self.slot_index(key);
        &self.slots[idx].1
    }

    pub(crate) fn slot_mut(&mut self, key: &Key) -> &mut KeySlot {
        let idx = self.slot_index(key);
        &mut self.slots[idx].1
    }

    /// The implicit-commit predicate: the record is staging and every key
    /// holds an unresolved intent at the record's epoch with a timestamp at
    /// most the record's.
    pub(crate) fn implicit_commit(&self) -> bool {
        self.record.status() == TxnStatus::Staging
            && self
                .slots
                .iter()
                .all(|(_, slot)| slot.query(self.record.epoch(), self.record.ts()))
    }

    /// The explicit-commit predicate: the record is committed.
    pub(crate) fn explicit_commit(&self) -> bool {
        self.record.status() == TxnStatus::Committed
    }

    fn slot_index(&self, key: &Key) -> usize {
        self.slots
            .binary_search_by(|(k, _)| (*k).cmp(key))
            .unwrap_or_else(|_| panic!("key {key:?} is not in the transaction write set"))
    }
}

/// A consistent point-in-time copy of the shared state.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// The transaction record.
    pub record: TxnRecord,
    /// Whether the client has been acknowledged.
    pub commit_ack: bool,
    /// Whether the implicit-commit condition held at snapshot time.
    pub implicit_commit: bool,
    /// Per-key intent and timestamp-cache observations.
    pub keys: BTreeMap<Key, KeyObservation>,
}

/// One key's share of a [`StateSnapshot`].
#[derive(Debug, Clone, Copy)]
pub struct KeyObservation {
    /// The intent laid at this key.
    pub intent: Intent,
    /// The timestamp-cache floor for this key.
    pub tscache: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_key_state() -> (SharedTxnState, Key, Key) {
        let x = Key::from("x");
        let y = Key::from("y");
        let writes = WriteSet::new([x.clone()], [y.clone()]).unwrap();
        (SharedTxnState::new(&writes), x, y)
    }

    #[test]
    fn test_initial_snapshot() {
        let (state, x, y) = two_key_state();
        let snap = state.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Pending);
        assert!(!snap.commit_ack);
        assert!(!snap.implicit_commit);
        assert_eq!(snap.keys.len(), 2);
        assert_eq!(snap.keys[&x].intent, Intent::default());
        assert_eq!(snap.keys[&y].tscache, 0);
    }

    #[test]
    fn test_observe_read_advances_tscache() {
        let (state, x, _) = two_key_state();
        state.observe_read(&x, 4);
        state.observe_read(&x, 2);
        assert_eq!(state.snapshot().keys[&x].tscache, 4);
    }

    #[test]
    fn test_implicit_commit_requires_record_and_all_intents() {
        let (state, x, y) = two_key_state();

        state.key_step(&x, |slot| slot.lay(1, 1));
        state.key_step(&y, |slot| slot.lay(1, 1));
        // All intents laid, but the record is still pending.
        assert!(!state.snapshot().implicit_commit);

        state.record_step(|record| record.stage(1, 1));
        assert!(state.snapshot().implicit_commit);

        // Resolving any one intent breaks the condition.
        state.key_step(&y, |slot| {
            slot.resolve();
        });
        assert!(!state.snapshot().implicit_commit);
    }

    #[test]
    fn test_implicit_commit_ts_comparison() {
        let (state, x, y) = two_key_state();
        state.key_step(&x, |slot| slot.lay(1, 1));
        state.key_step(&y, |slot| slot.lay(1, 2));
        // Record staged above both intent timestamps: implicit commit.
        state.record_step(|record| record.stage(1, 2));
        assert!(state.snapshot().implicit_commit);
    }

    #[test]
    fn test_intent_above_record_ts_blocks_implicit_commit() {
        let (state, x, y) = two_key_state();
        state.key_step(&x, |slot| slot.lay(1, 3));
        state.key_step(&y, |slot| slot.lay(1, 1));
        state.record_step(|record| record.stage(1, 2));
        assert!(!state.snapshot().implicit_commit);
    }

    #[test]
    #[should_panic(expected = "not in the transaction write set")]
    fn test_unknown_key_panics() {
        let (state, _, _) = two_key_state();
        state.observe_read(&Key::from("z"), 1);
    }
}
