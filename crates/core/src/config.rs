//! Configuration surface.
//!
//! [`CacheConfig`] is carried by every subscription family and controls how
//! long the last known value survives once the last consumer detaches.
//! [`RetryConfig`] drives the periodic acquisition strategy and its backoff.

use crate::error::{Error, Result};
use core::time::Duration;

/// Cache retention policy of a subscription family.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheConfig {
    /// Grace period before releasing the cache and stopping the fetch after
    /// the last consumer detaches. `None` or zero releases immediately.
    pub ttl: Option<Duration>,
    /// Whether a subscriber is evicted from its pool once it is idle and
    /// its cache has been cleared.
    pub evict_idle: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheConfig {
    /// Creates the default policy: no retention, idle eviction on.
    pub const fn new() -> Self {
        Self {
            ttl: None,
            evict_idle: true,
        }
    }

    /// Sets the retention TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Keeps idle subscribers in their pool forever.
    pub fn without_eviction(mut self) -> Self {
        self.evict_idle = false;
        self
    }

    /// Returns the retention window, if it is positive.
    #[inline]
    pub fn retention(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }

    /// Delay of the deferred expiry timer used when there is no retention.
    #[inline]
    pub fn expiry_delay(&self) -> Duration {
        self.ttl.unwrap_or_default()
    }

    /// Validates the policy. Every combination is currently accepted.
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Delay policy applied after a failed periodic fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorInterval {
    /// Same delay after every failure.
    Fixed(Duration),
    /// Delay `n - 1` after failure `n`, clamped to the last element. An
    /// empty sequence falls back to the base interval.
    Sequence(Vec<Duration>),
}

impl Default for ErrorInterval {
    fn default() -> Self {
        Self::Sequence(Vec::new())
    }
}

impl From<Duration> for ErrorInterval {
    fn from(delay: Duration) -> Self {
        Self::Fixed(delay)
    }
}

impl From<Vec<Duration>> for ErrorInterval {
    fn from(delays: Vec<Duration>) -> Self {
        Self::Sequence(delays)
    }
}

impl ErrorInterval {
    /// Returns the delay before the next attempt after `retry_count`
    /// consecutive failures.
    pub fn delay_for(&self, retry_count: u32, base: Duration) -> Duration {
        match self {
            ErrorInterval::Fixed(delay) => *delay,
            ErrorInterval::Sequence(delays) => match delays.len() {
                0 => base,
                len => {
                    let index = (retry_count.saturating_sub(1) as usize).min(len - 1);
                    delays[index]
                }
            },
        }
    }
}

/// Periodic fetch and backoff policy.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
    /// Delay between successful fetches.
    pub interval: Duration,
    /// Whether a failed fetch is retried at all.
    pub should_retry_on_error: bool,
    /// Delay policy after failures.
    pub error_interval: ErrorInterval,
    /// Number of consecutive failures after which retrying stops.
    /// `None` retries forever.
    pub maximum_retry_count: Option<u32>,
}

impl RetryConfig {
    /// Creates a policy fetching every `interval`, retrying forever at the
    /// same interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            should_retry_on_error: true,
            error_interval: ErrorInterval::default(),
            maximum_retry_count: None,
        }
    }

    /// Enables or disables retrying after a failure.
    pub fn with_retry_on_error(mut self, retry: bool) -> Self {
        self.should_retry_on_error = retry;
        self
    }

    /// Sets the delay policy after failures.
    pub fn with_error_interval(mut self, error_interval: impl Into<ErrorInterval>) -> Self {
        self.error_interval = error_interval.into();
        self
    }

    /// Caps the number of consecutive failures.
    pub fn with_maximum_retry_count(mut self, count: u32) -> Self {
        self.maximum_retry_count = Some(count);
        self
    }

    /// Returns the delay after `retry_count` consecutive failures.
    #[inline]
    pub fn error_delay(&self, retry_count: u32) -> Duration {
        self.error_interval.delay_for(retry_count, self.interval)
    }

    /// Returns true if `retry_count` consecutive failures exhaust the policy.
    #[inline]
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        self.maximum_retry_count
            .is_some_and(|max| retry_count >= max)
    }

    /// Validates the policy.
    ///
    /// Zero delays would turn the periodic loop into a busy loop, and a zero
    /// retry cap would terminate before the first failure is counted.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::invalid_config("interval must be positive"));
        }
        match &self.error_interval {
            ErrorInterval::Fixed(delay) if delay.is_zero() => {
                return Err(Error::invalid_config("error interval must be positive"));
            }
            ErrorInterval::Sequence(delays) if delays.iter().any(Duration::is_zero) => {
                return Err(Error::invalid_config(
                    "error interval sequence must only contain positive delays",
                ));
            }
            _ => {}
        }
        if self.maximum_retry_count == Some(0) {
            return Err(Error::invalid_config("maximum retry count must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_cache_config_retention() {
        assert_eq!(CacheConfig::new().retention(), None);
        assert_eq!(CacheConfig::new().with_ttl(Duration::ZERO).retention(), None);
        assert_eq!(CacheConfig::new().with_ttl(ms(100)).retention(), Some(ms(100)));
        assert_eq!(CacheConfig::new().expiry_delay(), Duration::ZERO);
        assert!(CacheConfig::default().evict_idle);
        assert!(!CacheConfig::new().without_eviction().evict_idle);
    }

    #[test]
    fn test_sequence_backoff_clamps() {
        let interval = ErrorInterval::from(vec![ms(1000), ms(2000), ms(5000)]);
        let delays: Vec<_> = (1..=5).map(|n| interval.delay_for(n, ms(300))).collect();
        assert_eq!(delays, vec![ms(1000), ms(2000), ms(5000), ms(5000), ms(5000)]);
    }

    #[test]
    fn test_empty_sequence_uses_base() {
        let interval = ErrorInterval::default();
        assert_eq!(interval.delay_for(3, ms(250)), ms(250));
    }

    #[test]
    fn test_fixed_backoff() {
        let interval = ErrorInterval::from(ms(700));
        assert_eq!(interval.delay_for(1, ms(10)), ms(700));
        assert_eq!(interval.delay_for(99, ms(10)), ms(700));
    }

    #[test]
    fn test_retry_config_exhaustion() {
        let config = RetryConfig::new(ms(100)).with_maximum_retry_count(3);
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert!(!RetryConfig::new(ms(100)).is_exhausted(u32::MAX));
    }

    #[test]
    fn test_retry_config_validate() {
        assert!(RetryConfig::new(ms(100)).validate().is_ok());
        assert!(RetryConfig::new(Duration::ZERO).validate().is_err());
        assert!(RetryConfig::new(ms(100))
            .with_error_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RetryConfig::new(ms(100))
            .with_error_interval(vec![ms(1), Duration::ZERO])
            .validate()
            .is_err());
        assert!(RetryConfig::new(ms(100))
            .with_maximum_retry_count(0)
            .validate()
            .is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_retry_config_serde() {
        let config = RetryConfig::new(ms(100)).with_error_interval(vec![ms(1000)]);
        let json = serde_json::to_string(&config).unwrap();
        let back: RetryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    proptest! {
        /// Property: a non-empty sequence always yields one of its elements,
        /// and never an earlier element than the previous failure did.
        #[test]
        fn sequence_delay_is_monotonic_in_index(
            delays in prop::collection::vec(1u64..10_000, 1..8),
            count in 1u32..32,
        ) {
            let delays: Vec<Duration> = delays.into_iter().map(ms).collect();
            let interval = ErrorInterval::from(delays.clone());

            let current = interval.delay_for(count, ms(1));
            let expected = delays[((count - 1) as usize).min(delays.len() - 1)];
            prop_assert_eq!(current, expected);
            prop_assert!(delays.contains(&current));
        }
    }
}
