// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Shared-state error types.

use super::Key;

/// Errors that can occur when assembling the shared transaction state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("key {key:?} appears in both the pipelined and parallel subsets")]
    OverlappingWriteSet { key: Key },
}
