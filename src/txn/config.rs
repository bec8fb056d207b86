// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Committer configuration.

use super::error::ProtocolError;

/// Configuration for driving a transaction to commit.
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// After this many attempts (epoch restarts plus timestamp refreshes),
    /// the committer abandons the transaction and leaves it for recovery to
    /// settle. Must be positive.
    max_attempts: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

impl CommitConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the attempt budget.
    #[inline]
    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    /// Checks the configuration for nonsense values.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.max_attempts == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CommitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CommitConfig::new().with_max_attempts(3);
        assert_eq!(config.max_attempts(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = CommitConfig::new().with_max_attempts(0);
        assert!(matches!(
            config.validate(),
            Err(ProtocolError::InvalidConfig(_))
        ));
    }
}
