//! Error types for tokentrail.
//!
//! Configuration errors are surfaced eagerly at construction time and never
//! reach the runtime paths. Persistence errors are recovered locally where
//! the contract demands it (saves) and propagated where the caller has to
//! decide (startup hydration).

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for tokentrail operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tokentrail.
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Configuration Errors
    // ==========================================================================
    #[error("Invalid capacity {0}: must be greater than zero")]
    InvalidCapacity(usize),

    #[error("Invalid retain tail {retain_tail}: must be less than capacity {capacity}")]
    InvalidRetainTail { retain_tail: usize, capacity: usize },

    #[error("Invalid ttl: must be greater than zero")]
    InvalidTtl,

    #[error("Invalid sweep period: must be greater than zero")]
    InvalidSweepPeriod,

    // ==========================================================================
    // Persistence Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No persisted contents at {}", .0.display())]
    StoreMissing(PathBuf),

    #[error("Store lock timed out: {0}")]
    StoreLockTimeout(String),
}

impl Error {
    /// Returns `true` for errors rejected at configuration-build time.
    ///
    /// These never reach a constructed queue or scheduler.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidCapacity(_)
                | Self::InvalidRetainTail { .. }
                | Self::InvalidTtl
                | Self::InvalidSweepPeriod
        )
    }

    /// Returns `true` for persistence failures that the in-memory core
    /// recovers from (logged, never turned into admission failures).
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Serialization(_) | Self::StoreMissing(_) | Self::StoreLockTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_classified() {
        let cases = [
            Error::InvalidCapacity(0),
            Error::InvalidRetainTail {
                retain_tail: 5,
                capacity: 5,
            },
            Error::InvalidTtl,
            Error::InvalidSweepPeriod,
        ];
        for err in &cases {
            assert!(err.is_configuration(), "{err:?} should be configuration");
            assert!(!err.is_persistence());
        }
    }

    #[test]
    fn persistence_errors_classified() {
        let cases = [
            Error::Io(std::io::Error::other("x")),
            Error::StoreMissing(PathBuf::from("/nowhere/tokens.json")),
            Error::StoreLockTimeout("busy".into()),
        ];
        for err in &cases {
            assert!(err.is_persistence(), "{err:?} should be persistence");
            assert!(!err.is_configuration());
        }
    }

    #[test]
    fn display_includes_offending_values() {
        let err = Error::InvalidRetainTail {
            retain_tail: 8,
            capacity: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains('8'), "message should name the values: {msg}");
    }
}
