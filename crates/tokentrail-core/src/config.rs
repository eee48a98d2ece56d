//! Validated configuration for queues and the sweep scheduler.
//!
//! Validation happens at configuration-build time, before any queue or
//! scheduler is constructed. Invalid relationships (e.g. a retain tail that
//! would pin the whole queue) are rejected with a typed error, never
//! silently coerced.

use std::time::Duration;

use crate::error::{Error, Result};

/// Admission and eviction parameters for one [`BoundedTokenQueue`].
///
/// [`BoundedTokenQueue`]: crate::queue::BoundedTokenQueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Maximum records retained. Must be > 0.
    pub capacity: usize,
    /// Minimum spacing since the newest record before another insertion is
    /// accepted. Zero disables the gate.
    pub cool_time: Duration,
    /// Newest records that eviction may never remove. Must be < `capacity`.
    pub retain_tail: usize,
    /// Age after which a record becomes eligible for eviction, subject to
    /// `retain_tail`. Must be > 0.
    pub ttl: Duration,
}

impl Default for HistoryConfig {
    /// Defaults: capacity 16, no cool time, retain the single newest record,
    /// one hour ttl.
    fn default() -> Self {
        Self {
            capacity: 16,
            cool_time: Duration::ZERO,
            retain_tail: 1,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl HistoryConfig {
    /// Build a validated config.
    pub fn new(
        capacity: usize,
        cool_time: Duration,
        retain_tail: usize,
        ttl: Duration,
    ) -> Result<Self> {
        let config = Self {
            capacity,
            cool_time,
            retain_tail,
            ttl,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants: `capacity > 0`, `retain_tail < capacity`,
    /// `ttl > 0`. (`cool_time >= 0` holds by construction for `Duration`.)
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidCapacity(self.capacity));
        }
        if self.retain_tail >= self.capacity {
            return Err(Error::InvalidRetainTail {
                retain_tail: self.retain_tail,
                capacity: self.capacity,
            });
        }
        if self.ttl.is_zero() {
            return Err(Error::InvalidTtl);
        }
        Ok(())
    }

    /// Cool time in milliseconds, clamped to `i64::MAX`.
    #[must_use]
    pub fn cool_time_millis(&self) -> i64 {
        i64::try_from(self.cool_time.as_millis()).unwrap_or(i64::MAX)
    }

    /// Ttl in milliseconds, clamped to `i64::MAX`.
    #[must_use]
    pub fn ttl_millis(&self) -> i64 {
        i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Timing for the shared sweep timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Delay before the first pass after the timer starts.
    pub initial_delay: Duration,
    /// Fixed rate between passes. Must be > 0.
    pub period: Duration,
}

impl Default for SweepConfig {
    /// Defaults: first pass after one period, period 10 seconds.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            period: Duration::from_secs(10),
        }
    }
}

impl SweepConfig {
    /// Build a validated config.
    pub fn new(initial_delay: Duration, period: Duration) -> Result<Self> {
        let config = Self {
            initial_delay,
            period,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the period is non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.period.is_zero() {
            return Err(Error::InvalidSweepPeriod);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_history_config_is_valid() {
        HistoryConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = HistoryConfig::new(0, Duration::ZERO, 0, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidCapacity(0)));
    }

    #[test]
    fn retain_tail_equal_to_capacity_rejected() {
        // A queue that retains everything can never evict.
        let err = HistoryConfig::new(4, Duration::ZERO, 4, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidRetainTail {
                retain_tail: 4,
                capacity: 4
            }
        ));
    }

    #[test]
    fn retain_tail_above_capacity_rejected() {
        let err = HistoryConfig::new(4, Duration::ZERO, 9, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidRetainTail { .. }));
    }

    #[test]
    fn zero_ttl_rejected() {
        let err = HistoryConfig::new(4, Duration::ZERO, 1, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::InvalidTtl));
    }

    #[test]
    fn zero_retain_tail_accepted() {
        let config = HistoryConfig::new(1, Duration::ZERO, 0, Duration::from_millis(1)).unwrap();
        assert_eq!(config.retain_tail, 0);
    }

    #[test]
    fn millis_accessors_round() {
        let config =
            HistoryConfig::new(8, Duration::from_millis(1500), 1, Duration::from_secs(60))
                .unwrap();
        assert_eq!(config.cool_time_millis(), 1500);
        assert_eq!(config.ttl_millis(), 60_000);
    }

    #[test]
    fn huge_durations_clamp_instead_of_overflowing() {
        let config = HistoryConfig {
            capacity: 2,
            cool_time: Duration::MAX,
            retain_tail: 0,
            ttl: Duration::MAX,
        };
        assert_eq!(config.cool_time_millis(), i64::MAX);
        assert_eq!(config.ttl_millis(), i64::MAX);
    }

    #[test]
    fn sweep_period_must_be_positive() {
        let err = SweepConfig::new(Duration::ZERO, Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::InvalidSweepPeriod));
        SweepConfig::new(Duration::ZERO, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn default_sweep_period_is_ten_seconds() {
        let config = SweepConfig::default();
        assert_eq!(config.period, Duration::from_secs(10));
        config.validate().unwrap();
    }
}
