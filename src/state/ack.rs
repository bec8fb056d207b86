// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Client commit acknowledgment.

use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot commit acknowledgment flag.
///
/// Set exactly once, by the committer, after it has observed the transaction
/// to be implicitly or explicitly committed. Once set, the transaction must
/// eventually become explicitly committed. Observers may read the flag at
/// any time.
#[derive(Debug, Default)]
pub struct CommitAck {
    acked: AtomicBool,
}

impl CommitAck {
    /// Creates an unset acknowledgment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the client has been acknowledged.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.acked.load(Ordering::Acquire)
    }

    /// Acknowledges the client.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the acknowledgment has a single writer and a
    /// single transition.
    pub(crate) fn set(&self) {
        let prev = self.acked.swap(true, Ordering::AcqRel);
        assert!(!prev, "commit acknowledgment is one-shot");
    }
}
