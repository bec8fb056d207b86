// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The committer state machine.
//!
//! Exactly one committer drives a transaction through epochs and phases
//! until it is explicitly committed or aborted. The committer performs all
//! of the transaction's writes and stages the record in a single round:
//! pipelined keys are written one at a time while the record is still
//! pending, parallel keys are written concurrently with staging the record,
//! and the commit outcome is deduced from the presence of every staged
//! write plus the staged record.
//!
//! The machine advances one named protocol step per [`Committer::step`]
//! call. Each step sees a consistent view of the shared objects it touches
//! and commits its mutation indivisibly, so any number of recovery actors
//! may interleave between steps.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::state::{Key, SharedTxnState, TxnStatus, WriteSet};

use super::config::CommitConfig;
use super::error::ProtocolError;
use super::policy::{BlockedWrite, CommitPolicy, RefreshFirst, StagingStep};

/// The committer's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Open the next epoch, or give up past the attempt budget.
    BeginEpoch,
    /// Write pipelined keys one at a time with the record still pending.
    Pipeline,
    /// Probe pipelined writes, lay parallel writes, and stage the record,
    /// in policy order.
    Staging,
    /// Acknowledge the client: the transaction is implicitly or explicitly
    /// committed.
    Ack,
    /// Flip a staging record to explicitly committed.
    Finalize,
    /// Clean up intents.
    Resolve,
    /// Finished.
    Done(Outcome),
}

/// Final disposition of a committer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Explicitly committed and acknowledged.
    Committed,
    /// Aborted by a concurrent recovery actor.
    Aborted,
    /// Attempt budget exhausted; the record is left for recovery to settle.
    Abandoned,
}

/// Outcome of one parallel-write step, resolved under the step's locks.
enum WriteAttempt {
    Laid,
    AlreadyCurrent,
    Finalized(TxnStatus),
    Blocked { floor: u64 },
}

/// Outcome of one record-staging step.
enum StageAttempt {
    Staged,
    Aborted,
}

/// Drives one transaction to commit.
///
/// Construct with [`Committer::new`] (default policy) or
/// [`Committer::with_policy`], then call [`step`](Committer::step) under a
/// scheduler or [`run`](Committer::run) to completion.
pub struct Committer<P: CommitPolicy = RefreshFirst> {
    shared: Arc<SharedTxnState>,
    writes: WriteSet,
    max_attempts: u64,
    policy: P,

    attempt: u64,
    epoch: u64,
    ts: u64,
    to_write: BTreeSet<Key>,
    to_check: BTreeSet<Key>,
    to_resolve: BTreeSet<Key>,
    have_staged_record: bool,
    phase: Phase,
}

impl Committer<RefreshFirst> {
    /// Creates a committer with the default policy.
    pub fn new(
        shared: Arc<SharedTxnState>,
        writes: WriteSet,
        config: &CommitConfig,
    ) -> Result<Self, ProtocolError> {
        Self::with_policy(shared, writes, config, RefreshFirst)
    }
}

impl<P: CommitPolicy> Committer<P> {
    /// Creates a committer with an explicit staging policy.
    pub fn with_policy(
        shared: Arc<SharedTxnState>,
        writes: WriteSet,
        config: &CommitConfig,
        policy: P,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let to_resolve = writes.keys();
        Ok(Self {
            shared,
            writes,
            max_attempts: config.max_attempts(),
            policy,
            attempt: 1,
            epoch: 0,
            ts: 0,
            to_write: BTreeSet::new(),
            to_check: BTreeSet::new(),
            to_resolve,
            have_staged_record: false,
            phase: Phase::BeginEpoch,
        })
    }

    /// Returns the current phase.
    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns true once the committer has finished.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done(_))
    }

    /// Returns the final outcome, if finished.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.phase {
            Phase::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Returns the current transaction epoch.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the current transaction timestamp.
    #[inline]
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Returns the current attempt number (starting at 1).
    #[inline]
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Executes exactly one protocol step and returns the phase entered.
    pub fn step(&mut self) -> Phase {
        match self.phase {
            Phase::BeginEpoch => self.begin_epoch(),
            Phase::Pipeline => self.pipeline_step(),
            Phase::Staging => self.staging_step(),
            Phase::Ack => self.ack_step(),
            Phase::Finalize => self.finalize_step(),
            Phase::Resolve => self.resolve_step(),
            Phase::Done(_) => {}
        }
        self.phase
    }

    /// Runs the committer to completion.
    pub fn run(&mut self) -> Outcome {
        loop {
            if let Phase::Done(outcome) = self.step() {
                return outcome;
            }
        }
    }

    fn begin_epoch(&mut self) {
        if self.attempt > self.max_attempts {
            warn!(
                attempt = self.attempt,
                max_attempts = self.max_attempts,
                "attempt budget exhausted; abandoning the transaction"
            );
            self.finish(Outcome::Abandoned);
            return;
        }
        self.epoch += 1;
        self.ts += 1;
        self.to_write = self.writes.pipelined().clone();
        self.phase = Phase::Pipeline;
        debug!(
            epoch = self.epoch,
            ts = self.ts,
            attempt = self.attempt,
            "epoch opened"
        );
    }

    fn pipeline_step(&mut self) {
        let Some(key) = self.to_write.first().cloned() else {
            self.enter_staging();
            return;
        };
        let (epoch, ts) = (self.epoch, self.ts);
        self.shared.key_step(&key, |slot| {
            if slot.intent().resolved() {
                // The write cannot land; the later probe of this key fails
                // and forces an epoch restart.
                trace!(?key, "skipping pipelined write to a resolved slot");
            } else {
                assert!(
                    slot.tscache() < ts,
                    "pipelined write at {key:?} blocked by the timestamp cache \
                     (floor {} >= ts {ts}); the fresh timestamp should be above \
                     every observed floor",
                    slot.tscache()
                );
                slot.lay(epoch, ts);
                trace!(?key, epoch, ts, "pipelined write laid");
            }
        });
        self.to_write.remove(&key);
        if self.to_write.is_empty() {
            self.enter_staging();
        }
    }

    /// Resets the staging working sets and moves to the staging phase, or
    /// abandons if the attempt budget ran out.
    fn enter_staging(&mut self) {
        if self.attempt > self.max_attempts {
            warn!(
                attempt = self.attempt,
                max_attempts = self.max_attempts,
                "attempt budget exhausted; abandoning the transaction"
            );
            self.finish(Outcome::Abandoned);
            return;
        }
        self.to_write = self.writes.parallel().clone();
        self.to_check = self.writes.pipelined().clone();
        self.have_staged_record = false;
        self.phase = Phase::Staging;
        debug!(
            epoch = self.epoch,
            ts = self.ts,
            attempt = self.attempt,
            "entering staging"
        );
    }

    fn staging_step(&mut self) {
        let can_query = !self.to_check.is_empty();
        let can_write = !self.to_write.is_empty();
        let can_stage = !self.have_staged_record;
        match self.policy.next_staging_step(can_query, can_write, can_stage) {
            StagingStep::Query => {
                assert!(can_query, "policy chose a disabled staging activity");
                self.query_pipelined();
            }
            StagingStep::Write => {
                assert!(can_write, "policy chose a disabled staging activity");
                self.parallel_write();
            }
            StagingStep::Stage => {
                assert!(can_stage, "policy chose a disabled staging activity");
                self.stage_record();
            }
        }
        if self.phase == Phase::Staging && self.staging_complete() {
            self.phase = Phase::Ack;
        }
    }

    fn staging_complete(&self) -> bool {
        self.to_check.is_empty() && self.to_write.is_empty() && self.have_staged_record
    }

    /// Probes one pipelined write. A missing write normally forces an epoch
    /// restart; if the record shows the transaction was already committed by
    /// a recovery actor (which then resolved our intents), the committer
    /// skips straight to acknowledging the client.
    fn query_pipelined(&mut self) {
        let Some(key) = self.to_check.first().cloned() else {
            return;
        };
        let (epoch, ts) = (self.epoch, self.ts);
        let result = self.shared.global_step(|view| {
            if view.slot(&key).query(epoch, ts) {
                Ok(())
            } else {
                Err(view.record().status())
            }
        });
        match result {
            Ok(()) => {
                trace!(?key, epoch, ts, "pipelined write confirmed");
                self.to_check.remove(&key);
            }
            Err(TxnStatus::Committed) => {
                debug!(
                    ?key,
                    "pipelined write resolved under a committed record; \
                     a recovery actor confirmed the commit"
                );
                self.phase = Phase::Ack;
            }
            Err(status) => {
                let err = ProtocolError::IntentMissing { key, epoch, ts };
                warn!(%err, record = %status, "restarting at a new epoch");
                self.restart();
            }
        }
    }

    /// Lays one parallel write, or reacts to whatever is in its way.
    fn parallel_write(&mut self) {
        let Some(key) = self.to_write.first().cloned() else {
            return;
        };
        let (epoch, ts) = (self.epoch, self.ts);
        let result = self.shared.global_step(|view| {
            let slot = view.slot(&key);
            let cur = slot.intent();
            if cur.epoch() == epoch {
                // Already laid at this epoch by a previous staging round.
                WriteAttempt::AlreadyCurrent
            } else if cur.resolved() {
                WriteAttempt::Finalized(view.record().status())
            } else if slot.tscache() >= ts {
                WriteAttempt::Blocked {
                    floor: slot.tscache(),
                }
            } else {
                view.slot_mut(&key).lay(epoch, ts);
                WriteAttempt::Laid
            }
        });
        match result {
            WriteAttempt::Laid => {
                trace!(?key, epoch, ts, "parallel write laid");
                self.to_write.remove(&key);
            }
            WriteAttempt::AlreadyCurrent => {
                trace!(?key, epoch, "parallel write already present");
                self.to_write.remove(&key);
            }
            WriteAttempt::Finalized(TxnStatus::Committed) => {
                debug!(
                    ?key,
                    "parallel write resolved under a committed record; \
                     a recovery actor confirmed the commit"
                );
                self.phase = Phase::Ack;
            }
            WriteAttempt::Finalized(TxnStatus::Aborted) => {
                warn!(err = %ProtocolError::AbortObserved, ?key, "stopping");
                self.finish(Outcome::Aborted);
            }
            WriteAttempt::Finalized(status) => {
                panic!("intent at {key:?} resolved while the record is {status}");
            }
            WriteAttempt::Blocked { floor } => {
                let err = ProtocolError::WriteTooOld { key, ts, floor };
                match self.policy.on_write_too_old(&err) {
                    BlockedWrite::Refresh => {
                        debug!(%err, "refreshing the transaction timestamp");
                        self.refresh();
                    }
                    BlockedWrite::Restart => {
                        debug!(%err, "restarting at a new epoch");
                        self.restart();
                    }
                }
            }
        }
    }

    /// Stages the record at the current `(epoch, ts)`.
    fn stage_record(&mut self) {
        let (epoch, ts) = (self.epoch, self.ts);
        let result = self.shared.record_step(|record| match record.status() {
            TxnStatus::Pending => {
                record.stage(epoch, ts);
                StageAttempt::Staged
            }
            TxnStatus::Staging => {
                assert!(
                    record.epoch() <= epoch && record.ts() < ts,
                    "staging record at ({}, {}) is not strictly behind ({epoch}, {ts})",
                    record.epoch(),
                    record.ts()
                );
                record.stage(epoch, ts);
                StageAttempt::Staged
            }
            TxnStatus::Aborted => StageAttempt::Aborted,
            TxnStatus::Committed => {
                panic!("record committed while the committer is still staging")
            }
        });
        match result {
            StageAttempt::Staged => {
                self.have_staged_record = true;
                debug!(epoch, ts, "record staged");
            }
            StageAttempt::Aborted => {
                warn!(err = %ProtocolError::AbortObserved, "stopping");
                self.finish(Outcome::Aborted);
            }
        }
    }

    /// Acknowledges the client. Legal only once the transaction is
    /// implicitly or explicitly committed; anything else is a protocol bug.
    fn ack_step(&mut self) {
        self.shared.global_step(|view| {
            assert!(
                view.implicit_commit() || view.explicit_commit(),
                "acknowledging the client without an implicit or explicit commit"
            );
            view.ack().set();
        });
        debug!("client acknowledged");
        self.phase = Phase::Finalize;
    }

    /// Makes the implicit commit explicit, unless a recovery actor already
    /// did.
    fn finalize_step(&mut self) {
        self.shared.global_step(|view| match view.record().status() {
            TxnStatus::Staging => {
                assert!(
                    view.implicit_commit(),
                    "finalizing a staging record that is not implicitly committed"
                );
                view.record_mut().commit();
                debug!("record explicitly committed");
            }
            TxnStatus::Committed => {
                trace!("record already explicitly committed");
            }
            status => panic!("cannot finalize a {status} record"),
        });
        self.phase = Phase::Resolve;
    }

    /// Resolves one intent per step.
    fn resolve_step(&mut self) {
        if let Some(key) = self.to_resolve.first().cloned() {
            self.shared.key_step(&key, |slot| {
                slot.resolve();
            });
            trace!(?key, "intent resolved");
            self.to_resolve.remove(&key);
        }
        if self.to_resolve.is_empty() {
            self.finish(Outcome::Committed);
        }
    }

    fn refresh(&mut self) {
        self.ts += 1;
        self.attempt += 1;
        self.enter_staging();
    }

    fn restart(&mut self) {
        self.attempt += 1;
        self.phase = Phase::BeginEpoch;
    }

    fn finish(&mut self, outcome: Outcome) {
        self.phase = Phase::Done(outcome);
        debug!(?outcome, "committer finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Intent;
    use crate::txn::policy::AlwaysRestart;

    fn setup(
        pipelined: &[&str],
        parallel: &[&str],
        max_attempts: u64,
    ) -> (Arc<SharedTxnState>, Committer<RefreshFirst>) {
        let writes = WriteSet::new(
            pipelined.iter().map(|k| Key::from(*k)),
            parallel.iter().map(|k| Key::from(*k)),
        )
        .unwrap();
        let shared = Arc::new(SharedTxnState::new(&writes));
        let config = CommitConfig::new().with_max_attempts(max_attempts);
        let committer = Committer::new(Arc::clone(&shared), writes, &config).unwrap();
        (shared, committer)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let writes = WriteSet::new([Key::from("x")], []).unwrap();
        let shared = Arc::new(SharedTxnState::new(&writes));
        let config = CommitConfig::new().with_max_attempts(0);
        assert!(Committer::new(shared, writes, &config).is_err());
    }

    #[test]
    fn test_uncontended_commit() {
        let (shared, mut committer) = setup(&["x"], &["y"], 3);
        assert_eq!(committer.run(), Outcome::Committed);

        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Committed);
        assert_eq!(snap.record.epoch(), 1);
        assert_eq!(snap.record.ts(), 1);
        assert!(snap.commit_ack);
        for observation in snap.keys.values() {
            assert_eq!(observation.intent.epoch(), 1);
            assert_eq!(observation.intent.ts(), 1);
            assert!(observation.intent.resolved());
        }
    }

    #[test]
    fn test_commit_with_no_pipelined_keys() {
        let (shared, mut committer) = setup(&[], &["x", "y"], 3);
        assert_eq!(committer.run(), Outcome::Committed);
        assert_eq!(shared.snapshot().record.status(), TxnStatus::Committed);
    }

    #[test]
    fn test_commit_with_empty_write_set() {
        // A transaction that writes nothing still stages and commits its
        // record.
        let (shared, mut committer) = setup(&[], &[], 3);
        assert_eq!(committer.run(), Outcome::Committed);
        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Committed);
        assert!(snap.commit_ack);
    }

    #[test]
    fn test_refresh_past_blocked_parallel_write() {
        let (shared, mut committer) = setup(&["y"], &["x"], 3);
        let x = Key::from("x");

        // Walk to the point where the record is staged at (1, 1) but the
        // parallel write on x has not run yet.
        while !(committer.phase() == Phase::Staging && shared.snapshot().record.ts() == 1) {
            committer.step();
        }
        // A reader at the transaction's timestamp blocks the write on x.
        shared.observe_read(&x, 1);

        assert_eq!(committer.run(), Outcome::Committed);
        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Committed);
        assert_eq!(snap.record.epoch(), 1);
        assert_eq!(snap.record.ts(), 2);
        assert_eq!(snap.keys[&x].intent.ts(), 2);
        assert_eq!(snap.keys[&Key::from("y")].intent.ts(), 1);
        assert!(snap.commit_ack);
        assert_eq!(committer.attempt(), 2);
    }

    #[test]
    fn test_restart_past_blocked_parallel_write() {
        let writes = WriteSet::new([Key::from("y")], [Key::from("x")]).unwrap();
        let shared = Arc::new(SharedTxnState::new(&writes));
        let config = CommitConfig::new().with_max_attempts(3);
        let mut committer =
            Committer::with_policy(Arc::clone(&shared), writes, &config, AlwaysRestart).unwrap();
        let x = Key::from("x");

        while !(committer.phase() == Phase::Staging && shared.snapshot().record.ts() == 1) {
            committer.step();
        }
        shared.observe_read(&x, 1);

        assert_eq!(committer.run(), Outcome::Committed);
        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Committed);
        // The restart rewrote everything at epoch 2.
        assert_eq!(snap.record.epoch(), 2);
        assert_eq!(snap.record.ts(), 2);
        assert_eq!(snap.keys[&x].intent.epoch(), 2);
        assert_eq!(snap.keys[&Key::from("y")].intent.epoch(), 2);
    }

    #[test]
    fn test_resolved_pipelined_slot_forces_epoch_restart_then_abandonment() {
        let (shared, mut committer) = setup(&["x"], &["y"], 3);

        // An external actor already resolved x: every epoch's probe of x
        // fails, so the committer restarts until its budget runs out.
        shared.key_step(&Key::from("x"), |slot| {
            slot.resolve();
        });

        assert_eq!(committer.run(), Outcome::Abandoned);
        assert!(committer.epoch() >= 2, "expected at least one epoch restart");
        assert!(!shared.commit_acked());

        // The record is left staging for recovery to settle.
        assert_eq!(shared.snapshot().record.status(), TxnStatus::Staging);
    }

    #[test]
    fn test_committer_stops_on_aborted_record() {
        let (shared, mut committer) = setup(&["x"], &["y"], 3);
        // A recovery actor aborts the pending record before the committer
        // stages it.
        shared.record_step(|record| record.abort());

        assert_eq!(committer.run(), Outcome::Aborted);
        assert!(!shared.commit_acked());
        let snap = shared.snapshot();
        assert_eq!(snap.record.status(), TxnStatus::Aborted);
        // The committer neither acknowledges nor resolves.
        assert!(!snap.keys[&Key::from("y")].intent.resolved());
    }

    #[test]
    fn test_committer_acks_after_recovery_commits() {
        let (shared, mut committer) = setup(&["x"], &[], 3);
        let x = Key::from("x");

        // Walk until the record is staged and only the probe of x remains.
        while !(committer.phase() == Phase::Staging
            && shared.snapshot().record.status() == TxnStatus::Staging)
        {
            committer.step();
        }

        // A recovery actor confirms the implicit commit and resolves the
        // intents before the committer's probe runs.
        shared.global_step(|view| {
            assert!(view.implicit_commit());
            view.record_mut().commit();
        });
        shared.key_step(&x, |slot| {
            slot.resolve();
        });

        assert_eq!(committer.run(), Outcome::Committed);
        assert!(shared.commit_acked());
        assert_eq!(shared.snapshot().record.status(), TxnStatus::Committed);
    }

    #[test]
    fn test_epoch_and_ts_are_committer_local_until_staged() {
        let (shared, mut committer) = setup(&[], &["x"], 3);
        committer.step(); // BeginEpoch
        assert_eq!(committer.epoch(), 1);
        assert_eq!(committer.ts(), 1);
        assert_eq!(shared.snapshot().record.epoch(), 0);
    }

    #[test]
    fn test_step_after_done_is_a_no_op() {
        let (_, mut committer) = setup(&[], &["x"], 3);
        let outcome = committer.run();
        assert_eq!(committer.step(), Phase::Done(outcome));
    }

    #[test]
    fn test_intent_snapshot_after_commit() {
        let (shared, mut committer) = setup(&["a", "b"], &["c"], 5);
        committer.run();
        let snap = shared.snapshot();
        for observation in snap.keys.values() {
            assert_ne!(observation.intent, Intent::default());
            assert!(observation.intent.resolved());
        }
    }
}
