// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Protocol error types.

use crate::state::{Key, StateError};

/// Errors produced and consumed inside the protocol state machines.
///
/// These are recoverable control-flow signals: the committer reacts to them
/// by refreshing its timestamp, restarting at a new epoch, or terminating.
/// Conditions that indicate a protocol bug or a misbehaving storage layer
/// are panics, never errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("write at key {key:?} too old: ts {ts} is not above the timestamp-cache floor {floor}")]
    WriteTooOld { key: Key, ts: u64, floor: u64 },

    #[error("pipelined write missing at key {key:?} (epoch {epoch}, ts {ts})")]
    IntentMissing { key: Key, epoch: u64, ts: u64 },

    #[error("transaction record aborted by a concurrent actor")]
    AbortObserved,

    #[error(transparent)]
    State(#[from] StateError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
