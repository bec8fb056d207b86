// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Provisional writes and the per-key timestamp cache.

/// A provisional write laid by the transaction at one key.
///
/// The zero value means "no intent": nothing has been laid yet (the first
/// write of a real transaction always carries epoch 1 or higher). Epoch and
/// timestamp never decrease. `resolved` is terminal: a resolved slot never
/// changes again and permanently refuses new writes by this transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Intent {
    epoch: u64,
    ts: u64,
    resolved: bool,
}

impl Intent {
    /// Returns the epoch at which the intent was laid.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the timestamp at which the intent was laid.
    #[inline]
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Returns true once the intent has been cleaned up.
    #[inline]
    pub fn resolved(&self) -> bool {
        self.resolved
    }

    /// Returns true if an unresolved write exists at `epoch` with a
    /// timestamp at most `ts`.
    #[inline]
    pub fn matches(&self, epoch: u64, ts: u64) -> bool {
        self.epoch == epoch && self.ts <= ts && !self.resolved
    }
}

/// Mutable per-key protocol state: the latest intent and the timestamp-cache
/// entry.
///
/// Each slot is guarded by its own mutex in [`SharedTxnState`], so a
/// protocol step that touches a single key gets its critical section from
/// the slot alone. The timestamp cache is a high watermark: no write at or
/// below it may succeed at this key.
///
/// [`SharedTxnState`]: super::SharedTxnState
#[derive(Debug, Default)]
pub struct KeySlot {
    intent: Intent,
    tscache: u64,
}

impl KeySlot {
    /// Returns a copy of the current intent.
    #[inline]
    pub fn intent(&self) -> Intent {
        self.intent
    }

    /// Returns the timestamp-cache floor for this key.
    #[inline]
    pub fn tscache(&self) -> u64 {
        self.tscache
    }

    /// Returns true if an unresolved intent exists at `epoch` with a
    /// timestamp at most `ts`.
    #[inline]
    pub fn query(&self, epoch: u64, ts: u64) -> bool {
        self.intent.matches(epoch, ts)
    }

    /// Lays an intent at `(epoch, ts)`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is resolved or the write would move the intent's
    /// epoch or timestamp backwards.
    pub(crate) fn lay(&mut self, epoch: u64, ts: u64) {
        assert!(
            !self.intent.resolved,
            "cannot lay an intent over a resolved slot"
        );
        assert!(
            epoch >= self.intent.epoch && ts >= self.intent.ts,
            "intent epoch/ts may not decrease: ({}, {}) -> ({epoch}, {ts})",
            self.intent.epoch,
            self.intent.ts
        );
        self.intent = Intent {
            epoch,
            ts,
            resolved: false,
        };
    }

    /// Advances the timestamp cache to at least `ts` and returns the new
    /// floor.
    pub(crate) fn bump_tscache(&mut self, ts: u64) -> u64 {
        self.tscache = self.tscache.max(ts);
        self.tscache
    }

    /// Marks the intent resolved. Returns true if this call performed the
    /// resolution, false if the slot was already resolved.
    pub(crate) fn resolve(&mut self) -> bool {
        !std::mem::replace(&mut self.intent.resolved, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_intent_does_not_match() {
        let slot = KeySlot::default();
        assert_eq!(slot.intent(), Intent::default());
        // Real transactions query at epoch >= 1, which the zero intent
        // never satisfies.
        assert!(!slot.query(1, 10));
    }

    #[test]
    fn test_lay_and_query() {
        let mut slot = KeySlot::default();
        slot.lay(1, 2);
        assert!(slot.query(1, 2));
        assert!(slot.query(1, 5));
        assert!(!slot.query(1, 1)); // laid above the queried ts
        assert!(!slot.query(2, 2)); // wrong epoch
    }

    #[test]
    fn test_relay_at_higher_epoch() {
        let mut slot = KeySlot::default();
        slot.lay(1, 1);
        slot.lay(2, 3);
        assert_eq!(slot.intent().epoch(), 2);
        assert_eq!(slot.intent().ts(), 3);
        assert!(!slot.query(1, 3));
        assert!(slot.query(2, 3));
    }

    #[test]
    #[should_panic(expected = "may not decrease")]
    fn test_lay_regression_panics() {
        let mut slot = KeySlot::default();
        slot.lay(2, 2);
        slot.lay(1, 3);
    }

    #[test]
    fn test_resolve_is_idempotent_and_terminal() {
        let mut slot = KeySlot::default();
        slot.lay(1, 1);
        assert!(slot.resolve());
        assert!(!slot.resolve());
        assert!(slot.intent().resolved());
        assert!(!slot.query(1, 1));
    }

    #[test]
    fn test_resolve_before_any_write() {
        // A recovery actor may resolve a key that was never written; the
        // slot becomes permanently unwritable.
        let mut slot = KeySlot::default();
        assert!(slot.resolve());
        assert!(slot.intent().resolved());
    }

    #[test]
    #[should_panic(expected = "resolved slot")]
    fn test_lay_after_resolve_panics() {
        let mut slot = KeySlot::default();
        slot.lay(1, 1);
        slot.resolve();
        slot.lay(2, 2);
    }

    #[test]
    fn test_tscache_is_a_high_watermark() {
        let mut slot = KeySlot::default();
        assert_eq!(slot.bump_tscache(3), 3);
        assert_eq!(slot.bump_tscache(1), 3);
        assert_eq!(slot.bump_tscache(5), 5);
        assert_eq!(slot.tscache(), 5);
    }
}
