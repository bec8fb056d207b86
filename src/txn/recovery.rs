// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The recovery state machine.
//!
//! Any actor that encounters a staged transaction may recover it. Either
//! every one of the transaction's writes is present at the staged epoch and
//! timestamp, in which case the implicit commit is made explicit, or at
//! least one write is missing, in which case the recoverer prevents that
//! write from ever landing (by advancing the key's timestamp cache) and
//! aborts the transaction. Either way the ambiguity of the staging record
//! is broken. A recoverer also settles transactions it finds pending or
//! already finalized, and always finishes by resolving every intent.
//!
//! Recoverers are weakly fair: any number may run concurrently with the
//! committer and with each other, interleaving at step granularity.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::state::{Key, SharedTxnState, TxnStatus, WriteSet};

/// The recoverer's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Push the record: abort it if pending, snapshot it if staging.
    Push,
    /// Probe the transaction's writes at the snapshotted epoch and
    /// timestamp, preventing the first one found missing.
    Probe,
    /// Settle the record based on what the probe found.
    Recover,
    /// Clean up intents.
    Resolve,
    /// Finished.
    Done(RecoveryOutcome),
}

/// What the recoverer did to the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// This recoverer aborted the transaction.
    Aborted,
    /// This recoverer confirmed the implicit commit and made it explicit.
    Committed,
    /// The transaction was already settled by another actor.
    AlreadyFinal,
}

/// Outcome of the push step, resolved under the record lock.
enum PushResult {
    Aborted,
    Snapshot { epoch: u64, ts: u64 },
    Final(TxnStatus),
}

/// Outcome of the recover step.
enum RecoverResult {
    Retry,
    Aborted,
    Committed,
    AlreadyFinal,
}

/// Recovers one transaction.
pub struct Recoverer {
    shared: Arc<SharedTxnState>,
    keys: BTreeSet<Key>,

    phase: RecoveryPhase,
    epoch: u64,
    ts: u64,
    found: BTreeSet<Key>,
    prevented: bool,
    outcome: RecoveryOutcome,
    to_resolve: BTreeSet<Key>,
}

impl Recoverer {
    /// Creates a recoverer for the transaction over `writes`.
    pub fn new(shared: Arc<SharedTxnState>, writes: &WriteSet) -> Self {
        let keys = writes.keys();
        let to_resolve = keys.clone();
        Self {
            shared,
            keys,
            phase: RecoveryPhase::Push,
            epoch: 0,
            ts: 0,
            found: BTreeSet::new(),
            prevented: false,
            outcome: RecoveryOutcome::AlreadyFinal,
            to_resolve,
        }
    }

    /// Returns the current phase.
    #[inline]
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Returns true once the recoverer has finished.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self.phase, RecoveryPhase::Done(_))
    }

    /// Returns the final outcome, if finished.
    pub fn outcome(&self) -> Option<RecoveryOutcome> {
        match self.phase {
            RecoveryPhase::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Executes exactly one protocol step and returns the phase entered.
    pub fn step(&mut self) -> RecoveryPhase {
        match self.phase {
            RecoveryPhase::Push => self.push_step(),
            RecoveryPhase::Probe => self.probe_step(),
            RecoveryPhase::Recover => self.recover_step(),
            RecoveryPhase::Resolve => self.resolve_step(),
            RecoveryPhase::Done(_) => {}
        }
        self.phase
    }

    /// Runs the recoverer to completion.
    pub fn run(&mut self) -> RecoveryOutcome {
        loop {
            if let RecoveryPhase::Done(outcome) = self.step() {
                return outcome;
            }
        }
    }

    fn push_step(&mut self) {
        let result = self.shared.record_step(|record| match record.status() {
            TxnStatus::Pending => {
                record.abort();
                PushResult::Aborted
            }
            TxnStatus::Staging => PushResult::Snapshot {
                epoch: record.epoch(),
                ts: record.ts(),
            },
            status => PushResult::Final(status),
        });
        match result {
            PushResult::Aborted => {
                warn!("aborted a pending transaction");
                self.settle(RecoveryOutcome::Aborted);
            }
            PushResult::Snapshot { epoch, ts } => {
                debug!(epoch, ts, "pushed a staging record; probing writes");
                self.epoch = epoch;
                self.ts = ts;
                self.found.clear();
                self.prevented = false;
                self.phase = RecoveryPhase::Probe;
            }
            PushResult::Final(status) => {
                debug!(%status, "record already settled");
                self.settle(RecoveryOutcome::AlreadyFinal);
            }
        }
    }

    /// Probes one write per step. The first missing write is prevented by
    /// advancing the key's timestamp cache to the snapshotted timestamp.
    fn probe_step(&mut self) {
        let Some(key) = self.keys.difference(&self.found).next().cloned() else {
            // Nothing left to probe: every write was found.
            self.phase = RecoveryPhase::Recover;
            return;
        };
        let (epoch, ts) = (self.epoch, self.ts);
        let found = self.shared.key_step(&key, |slot| {
            if slot.query(epoch, ts) {
                true
            } else {
                slot.bump_tscache(ts);
                false
            }
        });
        if found {
            trace!(?key, epoch, ts, "write found");
            self.found.insert(key);
            if self.found.len() == self.keys.len() {
                self.phase = RecoveryPhase::Recover;
            }
        } else {
            warn!(?key, ts, "write missing; prevented");
            self.prevented = true;
            self.phase = RecoveryPhase::Recover;
        }
    }

    /// Settles the record. With a prevented write the transaction is
    /// aborted unless the committer legally moved past our snapshot, in
    /// which case the push is retried. With every write found the implicit
    /// commit is made explicit.
    fn recover_step(&mut self) {
        let (epoch, ts, prevented) = (self.epoch, self.ts, self.prevented);
        let result = self.shared.global_step(|view| {
            let record = view.record();
            if prevented {
                match record.status() {
                    TxnStatus::Aborted | TxnStatus::Committed => RecoverResult::AlreadyFinal,
                    TxnStatus::Pending => {
                        panic!("staging record regressed to pending")
                    }
                    TxnStatus::Staging => {
                        let legal_change = record.epoch() >= epoch && record.ts() > ts;
                        if legal_change {
                            RecoverResult::Retry
                        } else {
                            view.record_mut().abort();
                            RecoverResult::Aborted
                        }
                    }
                }
            } else {
                match record.status() {
                    TxnStatus::Pending | TxnStatus::Aborted => panic!(
                        "every write was found at ({epoch}, {ts}) but the record is {}",
                        record.status()
                    ),
                    TxnStatus::Staging | TxnStatus::Committed => {
                        assert!(
                            record.epoch() == epoch && record.ts() == ts,
                            "record moved to ({}, {}) after every write was found at \
                             ({epoch}, {ts})",
                            record.epoch(),
                            record.ts()
                        );
                        if record.status() == TxnStatus::Staging {
                            assert!(
                                view.implicit_commit(),
                                "record staging at ({epoch}, {ts}) with every write \
                                 present is not implicitly committed"
                            );
                            view.record_mut().commit();
                            RecoverResult::Committed
                        } else {
                            RecoverResult::AlreadyFinal
                        }
                    }
                }
            }
        });
        match result {
            RecoverResult::Retry => {
                debug!(epoch, ts, "committer moved past our snapshot; retrying");
                self.phase = RecoveryPhase::Push;
            }
            RecoverResult::Aborted => {
                warn!(epoch, ts, "recovered and aborted");
                self.settle(RecoveryOutcome::Aborted);
            }
            RecoverResult::Committed => {
                debug!(epoch, ts, "implicit commit made explicit");
                self.settle(RecoveryOutcome::Committed);
            }
            RecoverResult::AlreadyFinal => {
                debug!("record settled by another actor");
                self.settle(RecoveryOutcome::AlreadyFinal);
            }
        }
    }

    /// Resolves one intent per step. Resolution is idempotent, so any
    /// number of actors may drain the same key set.
    fn resolve_step(&mut self) {
        if let Some(key) = self.to_resolve.first().cloned() {
            self.shared.key_step(&key, |slot| {
                slot.resolve();
            });
            trace!(?key, "intent resolved");
            self.to_resolve.remove(&key);
        }
        if self.to_resolve.is_empty() {
            self.phase = RecoveryPhase::Done(self.outcome);
            debug!(outcome = ?self.outcome, "recoverer finished");
        }
    }

    fn settle(&mut self, outcome: RecoveryOutcome) {
        self.outcome = outcome;
        self.phase = RecoveryPhase::Resolve;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{CommitConfig, Committer, Outcome};

    fn setup(pipelined: &[&str], parallel: &[&str]) -> (Arc<SharedTxnState>, WriteSet) {
        let writes = WriteSet::new(
            pipelined.iter().map(|k| Key::from(*k)),
            parallel.iter().map(|k| Key::from(*k)),
        )
        .unwrap();
        let shared = Arc::new(SharedTxnState::new(&writes));
        (shared, writes)
    }

    #[test]
    fn test_aborts_pending_transaction() {
        let (shared, writes) = setup(&["x"], &["y"]);
        let mut recoverer = Recoverer::new(Arc::clone(&shared), &writes);

        assert_eq!(recoverer.run(), RecoveryOutcome::Aborted);
        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Aborted);
        assert_eq!(snap.record.epoch(), 0);
        assert_eq!(snap.record.ts(), 0);
        // Every slot was resolved, even though nothing was ever written.
        for observation in snap.keys.values() {
            assert!(observation.intent.resolved());
        }
    }

    #[test]
    fn test_confirms_implicit_commit() {
        let (shared, writes) = setup(&[], &["x", "y"]);

        // The committer laid both writes and staged the record, then
        // stalled before acknowledging.
        shared.key_step(&Key::from("x"), |slot| slot.lay(1, 1));
        shared.key_step(&Key::from("y"), |slot| slot.lay(1, 1));
        shared.record_step(|record| record.stage(1, 1));

        let mut recoverer = Recoverer::new(Arc::clone(&shared), &writes);
        assert_eq!(recoverer.run(), RecoveryOutcome::Committed);

        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Committed);
        assert_eq!(snap.record.epoch(), 1);
        assert_eq!(snap.record.ts(), 1);
        for observation in snap.keys.values() {
            assert!(observation.intent.resolved());
        }
    }

    #[test]
    fn test_prevents_missing_write_and_aborts() {
        let (shared, writes) = setup(&[], &["x", "y"]);

        // Only x was laid; the record claims both.
        shared.key_step(&Key::from("x"), |slot| slot.lay(1, 1));
        shared.record_step(|record| record.stage(1, 1));

        let mut recoverer = Recoverer::new(Arc::clone(&shared), &writes);
        assert_eq!(recoverer.run(), RecoveryOutcome::Aborted);

        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Aborted);
        // The missing write was prevented at the staged timestamp.
        assert_eq!(snap.keys[&Key::from("y")].tscache, 1);
    }

    #[test]
    fn test_second_recoverer_observes_settled_record() {
        let (shared, writes) = setup(&[], &["x"]);
        shared.key_step(&Key::from("x"), |slot| slot.lay(1, 1));
        shared.record_step(|record| record.stage(1, 1));

        let mut first = Recoverer::new(Arc::clone(&shared), &writes);
        assert_eq!(first.run(), RecoveryOutcome::Committed);

        let mut second = Recoverer::new(Arc::clone(&shared), &writes);
        assert_eq!(second.run(), RecoveryOutcome::AlreadyFinal);
        assert_eq!(shared.snapshot().record.status(), TxnStatus::Committed);
    }

    #[test]
    fn test_retries_when_committer_moves_past_snapshot() {
        let (shared, writes) = setup(&[], &["x", "y"]);

        // The committer staged at (1, 1) with only x laid.
        shared.key_step(&Key::from("x"), |slot| slot.lay(1, 1));
        shared.record_step(|record| record.stage(1, 1));

        let mut recoverer = Recoverer::new(Arc::clone(&shared), &writes);
        // Push snapshots (1, 1); probing finds x but not y, preventing y.
        assert_eq!(recoverer.step(), RecoveryPhase::Probe);
        assert_eq!(recoverer.step(), RecoveryPhase::Probe); // x found
        assert_eq!(recoverer.step(), RecoveryPhase::Recover); // y prevented

        // Meanwhile the committer refreshed and restaged at (1, 2) and laid
        // both writes there.
        shared.record_step(|record| record.stage(1, 2));
        shared.key_step(&Key::from("y"), |slot| slot.lay(1, 2));

        // The recover step sees a legal change and retries from push.
        assert_eq!(recoverer.step(), RecoveryPhase::Push);

        // The second pass finds everything and commits.
        assert_eq!(recoverer.run(), RecoveryOutcome::Committed);
        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Committed);
        assert_eq!(snap.record.ts(), 2);
    }

    #[test]
    fn test_settles_abandoned_transaction() {
        let (shared, writes) = setup(&["x"], &["y"]);

        // A committer with a budget of one attempt abandons after its probe
        // of the pre-resolved key fails.
        shared.key_step(&Key::from("x"), |slot| {
            slot.resolve();
        });
        let config = CommitConfig::new().with_max_attempts(1);
        let mut committer =
            Committer::new(Arc::clone(&shared), writes.clone(), &config).unwrap();
        assert_eq!(committer.run(), Outcome::Abandoned);
        assert_eq!(shared.snapshot().record.status(), TxnStatus::Staging);

        // Recovery settles what the committer left behind.
        let mut recoverer = Recoverer::new(Arc::clone(&shared), &writes);
        assert_eq!(recoverer.run(), RecoveryOutcome::Aborted);
        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Aborted);
        for observation in snap.keys.values() {
            assert!(observation.intent.resolved());
        }
        assert!(!shared.commit_acked());
    }

    #[test]
    fn test_recovery_never_acknowledges() {
        let (shared, writes) = setup(&[], &["x"]);
        shared.key_step(&Key::from("x"), |slot| slot.lay(1, 1));
        shared.record_step(|record| record.stage(1, 1));

        let mut recoverer = Recoverer::new(Arc::clone(&shared), &writes);
        recoverer.run();
        // Confirming the commit is not the same as acknowledging the
        // client; only the committer does that.
        assert!(!shared.commit_acked());
    }
}
