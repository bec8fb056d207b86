// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Scheduling policy for the staging phase.
//!
//! The staging phase is three logically concurrent activities: probing the
//! pipelined writes, laying the parallel writes, and staging the record. In
//! a real deployment their completions arrive in arbitrary order; a policy
//! fixes one order for one execution, and decides whether a write blocked
//! by the timestamp cache is retried at a higher timestamp or at a new
//! epoch. Any weakly fair policy preserves correctness.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::error::ProtocolError;

/// One of the three staging activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingStep {
    /// Probe one pipelined write.
    Query,
    /// Lay one parallel write.
    Write,
    /// Stage the transaction record.
    Stage,
}

/// Reaction to a write blocked by the timestamp cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedWrite {
    /// Bump the transaction timestamp and re-enter staging; already-laid
    /// intents are detected as idempotent and not rewritten.
    Refresh,
    /// Restart at a new epoch, rewriting every intent from scratch.
    Restart,
}

/// Decides the committer's nondeterministic choices during staging.
///
/// `next_staging_step` must return an activity whose flag is true; at least
/// one flag is true whenever it is called.
pub trait CommitPolicy {
    /// Picks the next staging activity among those currently enabled.
    fn next_staging_step(
        &mut self,
        can_query: bool,
        can_write: bool,
        can_stage: bool,
    ) -> StagingStep;

    /// Picks how to get past a write blocked by the timestamp cache.
    fn on_write_too_old(&mut self, err: &ProtocolError) -> BlockedWrite;
}

/// The default policy: stage the record as early as possible, lay writes
/// next, probe pipelined writes last, and always refresh a blocked write.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefreshFirst;

impl CommitPolicy for RefreshFirst {
    fn next_staging_step(
        &mut self,
        _can_query: bool,
        can_write: bool,
        can_stage: bool,
    ) -> StagingStep {
        if can_stage {
            StagingStep::Stage
        } else if can_write {
            StagingStep::Write
        } else {
            StagingStep::Query
        }
    }

    fn on_write_too_old(&mut self, _err: &ProtocolError) -> BlockedWrite {
        BlockedWrite::Refresh
    }
}

/// Like [`RefreshFirst`], but restarts at a new epoch on a blocked write.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRestart;

impl CommitPolicy for AlwaysRestart {
    fn next_staging_step(
        &mut self,
        can_query: bool,
        can_write: bool,
        can_stage: bool,
    ) -> StagingStep {
        RefreshFirst.next_staging_step(can_query, can_write, can_stage)
    }

    fn on_write_too_old(&mut self, _err: &ProtocolError) -> BlockedWrite {
        BlockedWrite::Restart
    }
}

/// Draws every choice from a seeded RNG. Used by the harness to explore
/// staging-order interleavings reproducibly.
#[derive(Debug)]
pub struct SeededPolicy {
    rng: StdRng,
}

impl SeededPolicy {
    /// Creates a policy whose choices are determined by `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl CommitPolicy for SeededPolicy {
    fn next_staging_step(
        &mut self,
        can_query: bool,
        can_write: bool,
        can_stage: bool,
    ) -> StagingStep {
        let mut enabled = Vec::with_capacity(3);
        if can_query {
            enabled.push(StagingStep::Query);
        }
        if can_write {
            enabled.push(StagingStep::Write);
        }
        if can_stage {
            enabled.push(StagingStep::Stage);
        }
        enabled[self.rng.gen_range(0..enabled.len())]
    }

    fn on_write_too_old(&mut self, _err: &ProtocolError) -> BlockedWrite {
        if self.rng.gen_bool(0.5) {
            BlockedWrite::Refresh
        } else {
            BlockedWrite::Restart
        }
    }
}
