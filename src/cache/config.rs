// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection cache configuration

use std::time::Duration;

/// Delay between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    Fixed(Duration),
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// The delay before the given (0-indexed) attempt.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                base,
                max,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let delay_ms = base.as_millis() as f64 * multiplier.powi(exponent);
                Duration::from_millis(delay_ms.min(max.as_millis() as f64) as u64)
            }
            Self::Linear {
                initial,
                increment,
                max,
            } => increment
                .checked_mul(attempt)
                .and_then(|increment| initial.checked_add(increment))
                .map_or(*max, |delay| delay.min(*max)),
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Bounds the reconnect attempts after a failed liveness check.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Retries after the first failed reconnect attempt.
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl ReconnectPolicy {
    /// A single reconnect attempt without retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::Fixed(Duration::ZERO),
        }
    }

    #[must_use]
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Fixed(delay),
        }
    }

    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

pub const DEFAULT_MAX_LEASE_TIME: Duration = Duration::from_secs(5);

/// Tuning parameters of the [`ConnectionCache`](super::ConnectionCache).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Leases held longer than this are reported.
    pub max_lease_time: Duration,
    /// Upper bound for waiting on a lease.
    pub max_wait_time: Duration,
    /// How long a granted lease waits for its caller before it is returned.
    pub grant_timeout: Duration,
    /// Bound of the liveness check when a lease is closed.
    pub ping_timeout: Duration,
    /// Bound of a single connect attempt. Defaults to `max_wait_time`.
    pub connect_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    /// Records cache traces.
    pub tracing: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::with_max_lease_time(DEFAULT_MAX_LEASE_TIME)
    }
}

impl CacheConfig {
    /// Derives the maximum wait time (5 × `max_lease_time`).
    #[must_use]
    pub fn with_max_lease_time(max_lease_time: Duration) -> Self {
        Self {
            max_lease_time,
            max_wait_time: max_lease_time * 5,
            grant_timeout: Duration::from_millis(10),
            ping_timeout: Duration::from_secs(5),
            connect_timeout: None,
            reconnect: ReconnectPolicy::default(),
            tracing: false,
        }
    }

    #[must_use]
    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    #[must_use]
    pub fn with_grant_timeout(mut self, grant_timeout: Duration) -> Self {
        self.grant_timeout = grant_timeout;
        self
    }

    #[must_use]
    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(self.max_wait_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_time_derives_from_lease_time() {
        let config = CacheConfig::default();
        assert_eq!(config.max_lease_time, Duration::from_secs(5));
        assert_eq!(config.max_wait_time, Duration::from_secs(25));
        assert_eq!(config.grant_timeout, Duration::from_millis(10));
        assert_eq!(config.connect_timeout(), Duration::from_secs(25));

        let config = CacheConfig::with_max_lease_time(Duration::from_secs(1))
            .with_connect_timeout(Duration::from_millis(300));
        assert_eq!(config.max_wait_time, Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn linear_backoff_is_capped() {
        let backoff = BackoffStrategy::Linear {
            initial: Duration::from_millis(50),
            increment: Duration::from_millis(25),
            max: Duration::from_millis(100),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(75));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn retries_are_bounded() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!ReconnectPolicy::no_retry().should_retry(0));
    }
}
