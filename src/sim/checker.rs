// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Invariant checking over observed executions.

use crate::state::{SharedTxnState, StateSnapshot, TxnStatus};

/// Checks protocol invariants against a sequence of state snapshots.
///
/// The checker is fed one snapshot per scheduled step. It verifies the
/// per-state bounds and the cross-state monotonicity rules, and latches the
/// temporal observations (implicit commit seen, client acknowledged) that
/// the end-state assertions need. Violations panic with a message naming
/// the broken rule.
pub struct InvariantChecker {
    max_attempts: u64,
    prev: StateSnapshot,
    saw_implicit_commit: bool,
}

fn status_rank(status: TxnStatus) -> u8 {
    match status {
        TxnStatus::Pending => 0,
        TxnStatus::Staging => 1,
        TxnStatus::Committed | TxnStatus::Aborted => 2,
    }
}

impl InvariantChecker {
    /// Creates a checker with the initial state as its first observation.
    pub fn new(shared: &SharedTxnState, max_attempts: u64) -> Self {
        let prev = shared.snapshot();
        let checker = Self {
            max_attempts,
            saw_implicit_commit: prev.implicit_commit,
            prev,
        };
        checker.check_bounds(&checker.prev);
        checker
    }

    /// Observes the current state and checks it against the previous
    /// observation.
    pub fn observe(&mut self, shared: &SharedTxnState) {
        let snap = shared.snapshot();
        self.check_bounds(&snap);
        self.check_monotonic(&snap);
        self.saw_implicit_commit |= snap.implicit_commit;
        self.prev = snap;
    }

    /// Returns the most recent observation.
    pub fn last(&self) -> &StateSnapshot {
        &self.prev
    }

    /// Returns true if any observation satisfied the implicit-commit
    /// condition.
    pub fn saw_implicit_commit(&self) -> bool {
        self.saw_implicit_commit
    }

    /// Asserts the end-state properties of a settled transaction: the
    /// record is terminal, every intent is resolved, and a latched implicit
    /// commit or client acknowledgment implies an explicit commit.
    pub fn assert_settled(&self) {
        let snap = &self.prev;
        assert!(
            snap.record.status().is_terminal(),
            "settled transaction must have a terminal record, found {}",
            snap.record.status()
        );
        for (key, observation) in &snap.keys {
            assert!(
                observation.intent.resolved(),
                "settled transaction left an unresolved intent at {key:?}"
            );
        }
        if self.saw_implicit_commit {
            assert_eq!(
                snap.record.status(),
                TxnStatus::Committed,
                "an implicitly committed transaction must end explicitly committed"
            );
        }
        if snap.commit_ack {
            assert_eq!(
                snap.record.status(),
                TxnStatus::Committed,
                "an acknowledged transaction must end explicitly committed"
            );
        }
    }

    fn check_bounds(&self, snap: &StateSnapshot) {
        let max = self.max_attempts;
        assert!(
            snap.record.epoch() <= max && snap.record.ts() <= max,
            "record ({}, {}) outside the attempt-bounded range [0, {max}]",
            snap.record.epoch(),
            snap.record.ts()
        );
        for (key, observation) in &snap.keys {
            assert!(
                observation.intent.epoch() <= max && observation.intent.ts() <= max,
                "intent at {key:?} outside the attempt-bounded range [0, {max}]"
            );
            assert!(
                observation.tscache <= max,
                "timestamp cache at {key:?} outside the attempt-bounded range [0, {max}]"
            );
        }
    }

    fn check_monotonic(&self, snap: &StateSnapshot) {
        let prev = &self.prev;

        assert!(
            status_rank(snap.record.status()) >= status_rank(prev.record.status()),
            "record status regressed: {} -> {}",
            prev.record.status(),
            snap.record.status()
        );
        assert!(
            snap.record.epoch() >= prev.record.epoch() && snap.record.ts() >= prev.record.ts(),
            "record epoch/ts regressed"
        );
        if prev.record.status().is_terminal() {
            assert_eq!(
                snap.record, prev.record,
                "terminal record mutated: {:?} -> {:?}",
                prev.record, snap.record
            );
        }

        for (key, observation) in &snap.keys {
            let before = &prev.keys[key];
            assert!(
                observation.intent.epoch() >= before.intent.epoch()
                    && observation.intent.ts() >= before.intent.ts(),
                "intent epoch/ts regressed at {key:?}"
            );
            assert!(
                observation.intent.resolved() || !before.intent.resolved(),
                "intent resolution reverted at {key:?}"
            );
            if before.intent.resolved() {
                assert_eq!(
                    observation.intent, before.intent,
                    "resolved intent mutated at {key:?}"
                );
            }
            assert!(
                observation.tscache >= before.tscache,
                "timestamp cache regressed at {key:?}"
            );
        }

        assert!(
            snap.commit_ack || !prev.commit_ack,
            "commit acknowledgment reverted"
        );
    }
}
