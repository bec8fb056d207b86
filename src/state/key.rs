// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Keys and the transaction write set.

use std::collections::BTreeSet;

use super::error::StateError;

/// A key written by the transaction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub Vec<u8>);

impl Key {
    /// Creates a new key from bytes.
    #[inline]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the length of the key.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The transaction's write set, partitioned once at the start of the
/// transaction and fixed thereafter.
///
/// Pipelined keys are written one at a time while the record is still
/// pending. Parallel keys are written in the final batch, concurrently with
/// staging the record. The two subsets must be disjoint.
#[derive(Debug, Clone)]
pub struct WriteSet {
    pipelined: BTreeSet<Key>,
    parallel: BTreeSet<Key>,
}

impl WriteSet {
    /// Creates a write set from the two disjoint subsets.
    pub fn new(
        pipelined: impl IntoIterator<Item = Key>,
        parallel: impl IntoIterator<Item = Key>,
    ) -> Result<Self, StateError> {
        let pipelined: BTreeSet<Key> = pipelined.into_iter().collect();
        let parallel: BTreeSet<Key> = parallel.into_iter().collect();

        if let Some(key) = pipelined.intersection(&parallel).next() {
            return Err(StateError::OverlappingWriteSet { key: key.clone() });
        }

        Ok(Self {
            pipelined,
            parallel,
        })
    }

    /// Returns the keys written before the final batch.
    #[inline]
    pub fn pipelined(&self) -> &BTreeSet<Key> {
        &self.pipelined
    }

    /// Returns the keys written concurrently with staging the record.
    #[inline]
    pub fn parallel(&self) -> &BTreeSet<Key> {
        &self.parallel
    }

    /// Returns the full key set, in ascending order.
    pub fn keys(&self) -> BTreeSet<Key> {
        self.pipelined.union(&self.parallel).cloned().collect()
    }

    /// Returns true if the transaction writes `key`.
    pub fn contains(&self, key: &Key) -> bool {
        self.pipelined.contains(key) || self.parallel.contains(key)
    }

    /// Returns the number of keys in the write set.
    pub fn len(&self) -> usize {
        self.pipelined.len() + self.parallel.len()
    }

    /// Returns true if the transaction writes nothing.
    pub fn is_empty(&self) -> bool {
        self.pipelined.is_empty() && self.parallel.is_empty()
    }
}
