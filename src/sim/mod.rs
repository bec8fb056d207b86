// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Deterministic execution harness.
//!
//! Drives one committer and any number of recoverers over shared state at
//! protocol-step granularity. Schedules can be scripted (step one actor at
//! a time) or drawn from a seeded RNG, which makes interleaving bugs
//! reproducible from the seed alone. Invariants are checked after every
//! step.

mod checker;

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::state::{SharedTxnState, WriteSet};
use crate::txn::{
    CommitConfig, CommitPolicy, Committer, Outcome, Phase, ProtocolError, Recoverer,
    RecoveryOutcome, RecoveryPhase, RefreshFirst,
};

pub use checker::InvariantChecker;

/// One committer, `n` recoverers, shared state, and an invariant checker,
/// scheduled at protocol-step granularity.
pub struct Simulation<P: CommitPolicy = RefreshFirst> {
    shared: Arc<SharedTxnState>,
    committer: Committer<P>,
    recoverers: Vec<Recoverer>,
    checker: InvariantChecker,
}

impl Simulation<RefreshFirst> {
    /// Creates a simulation with the default committer policy.
    pub fn new(
        writes: WriteSet,
        config: &CommitConfig,
        recoverers: usize,
    ) -> Result<Self, ProtocolError> {
        Self::with_policy(writes, config, recoverers, RefreshFirst)
    }
}

impl<P: CommitPolicy> Simulation<P> {
    /// Creates a simulation with an explicit committer policy.
    pub fn with_policy(
        writes: WriteSet,
        config: &CommitConfig,
        recoverers: usize,
        policy: P,
    ) -> Result<Self, ProtocolError> {
        let shared = Arc::new(SharedTxnState::new(&writes));
        let committer =
            Committer::with_policy(Arc::clone(&shared), writes.clone(), config, policy)?;
        let recoverers = (0..recoverers)
            .map(|_| Recoverer::new(Arc::clone(&shared), &writes))
            .collect();
        let checker = InvariantChecker::new(&shared, config.max_attempts());
        Ok(Self {
            shared,
            committer,
            recoverers,
            checker,
        })
    }

    /// Returns the shared state.
    pub fn shared(&self) -> &Arc<SharedTxnState> {
        &self.shared
    }

    /// Returns the committer.
    pub fn committer(&self) -> &Committer<P> {
        &self.committer
    }

    /// Returns recoverer `i`.
    pub fn recoverer(&self, i: usize) -> &Recoverer {
        &self.recoverers[i]
    }

    /// Returns the invariant checker.
    pub fn checker(&self) -> &InvariantChecker {
        &self.checker
    }

    /// Steps the committer once and checks invariants.
    pub fn committer_step(&mut self) -> Phase {
        let phase = self.committer.step();
        self.checker.observe(&self.shared);
        phase
    }

    /// Steps recoverer `i` once and checks invariants.
    pub fn recoverer_step(&mut self, i: usize) -> RecoveryPhase {
        let phase = self.recoverers[i].step();
        self.checker.observe(&self.shared);
        phase
    }

    /// Runs the committer to completion.
    pub fn run_committer(&mut self) -> Outcome {
        loop {
            if let Phase::Done(outcome) = self.committer_step() {
                return outcome;
            }
        }
    }

    /// Runs recoverer `i` to completion.
    pub fn run_recoverer(&mut self, i: usize) -> RecoveryOutcome {
        loop {
            if let RecoveryPhase::Done(outcome) = self.recoverer_step(i) {
                return outcome;
            }
        }
    }

    /// Interleaves every actor under a uniformly random, seeded schedule
    /// until all of them finish. Random selection is weakly fair: an
    /// enabled actor is eventually scheduled.
    pub fn run_random(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        loop {
            let mut runnable = Vec::with_capacity(1 + self.recoverers.len());
            if !self.committer.is_done() {
                runnable.push(0);
            }
            for (i, recoverer) in self.recoverers.iter().enumerate() {
                if !recoverer.is_done() {
                    runnable.push(i + 1);
                }
            }
            if runnable.is_empty() {
                return;
            }
            match runnable[rng.gen_range(0..runnable.len())] {
                0 => {
                    self.committer_step();
                }
                i => {
                    self.recoverer_step(i - 1);
                }
            }
        }
    }

    /// Returns true once every actor has finished.
    pub fn is_quiescent(&self) -> bool {
        self.committer.is_done() && self.recoverers.iter().all(Recoverer::is_done)
    }

    /// Asserts the end-state properties once every actor has finished.
    ///
    /// With at least one recoverer (or a committer that finished on its
    /// own), the transaction must be settled: terminal record, resolved
    /// intents, and the latched temporal properties. An abandoned
    /// transaction with no recoverer is allowed to remain unsettled;
    /// progress is only promised under recoverer fairness.
    pub fn assert_quiescent(&self) {
        assert!(self.is_quiescent(), "actors still runnable");
        let settled = !self.recoverers.is_empty()
            || matches!(
                self.committer.outcome(),
                Some(Outcome::Committed | Outcome::Aborted)
            );
        if settled {
            self.checker.assert_settled();
        }
    }
}
