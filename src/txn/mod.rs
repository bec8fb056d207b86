// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Commit and recovery state machines.
//!
//! This module provides the two actor classes of the parallel commit
//! protocol:
//! - The [`Committer`] (exactly one per transaction) performs all of the
//!   transaction's writes and stages the record in a single round, then
//!   deduces the commit from the presence of every write.
//! - The [`Recoverer`] (any number, running concurrently) breaks the
//!   ambiguity of a staged transaction it encounters: it either confirms
//!   the implicit commit, making it explicit, or prevents a missing write
//!   and aborts.
//!
//! Both machines advance one atomic protocol step per `step()` call, so a
//! scheduler (or real threads) can interleave them arbitrarily. Safety
//! holds for every interleaving; progress needs only weak fairness from
//! the recoverers.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use paracommit::state::{Key, SharedTxnState, TxnStatus, WriteSet};
//! use paracommit::txn::{CommitConfig, Committer, Outcome};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Two keys are written before the final batch, one concurrently with
//! // staging the record.
//! let writes = WriteSet::new(
//!     [Key::from("acct/alice"), Key::from("acct/bob")],
//!     [Key::from("acct/carol")],
//! )?;
//! let shared = Arc::new(SharedTxnState::new(&writes));
//!
//! let config = CommitConfig::new().with_max_attempts(5);
//! let mut committer = Committer::new(Arc::clone(&shared), writes, &config)?;
//!
//! assert_eq!(committer.run(), Outcome::Committed);
//! assert_eq!(shared.snapshot().record.status(), TxnStatus::Committed);
//! assert!(shared.commit_acked());
//! # Ok(())
//! # }
//! ```

mod committer;
mod config;
mod error;
mod policy;
mod recovery;

pub use committer::{Committer, Outcome, Phase};
pub use config::CommitConfig;
pub use error::ProtocolError;
pub use policy::{AlwaysRestart, BlockedWrite, CommitPolicy, RefreshFirst, SeededPolicy, StagingStep};
pub use recovery::{Recoverer, RecoveryOutcome, RecoveryPhase};
