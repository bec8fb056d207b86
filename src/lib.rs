// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Parallel commit protocol state machines for distributed transactions.
//!
//! A transaction's writes and its staged record are laid down in a single
//! round of consensus rather than the classical two. A committed outcome is
//! deduced from the presence of every staged write plus a staged record;
//! any observer may recover the transaction, either confirming that
//! condition and making the commit explicit, or preventing a missing write
//! and aborting.
//!
//! The crate provides the shared mutable objects ([`state`]), the committer
//! and recovery state machines that race over them ([`txn`]), and a
//! step-granular execution harness for exploring interleavings ([`sim`]).
//! Storage, replication, and RPC are external collaborators; this is the
//! logical core they plug into.

pub mod sim;
pub mod state;
pub mod txn;

pub use sim::{InvariantChecker, Simulation};
pub use state::{
    CommitAck, Intent, Key, KeyObservation, SharedTxnState, StateError, StateSnapshot, TxnRecord,
    TxnStatus, WriteSet,
};
pub use txn::{
    AlwaysRestart, BlockedWrite, CommitConfig, CommitPolicy, Committer, Outcome, Phase,
    ProtocolError, Recoverer, RecoveryOutcome, RecoveryPhase, RefreshFirst, SeededPolicy,
    StagingStep,
};
