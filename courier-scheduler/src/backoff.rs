//! Retry backoff policy used by the in-memory backend.
//!
//! The curve is exponential with jitter, capped, and always bounded by the
//! envelope lifetime: an attempt that would land past expiry reports the
//! envelope expired instead.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay for the first retry (in seconds).
    ///
    /// Default: 400 seconds
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    /// Maximum delay between attempts (in seconds).
    ///
    /// Default: 14400 seconds (4 hours)
    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Jitter factor for randomizing delays, ±`jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `retry` (1-indexed).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let delay = if exponent >= 63 {
            self.max_delay_secs
        } else {
            self.base_delay_secs
                .saturating_mul(1u64 << exponent)
                .min(self.max_delay_secs)
        };

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let range = (delay as f64) * self.jitter_factor;
            if range > 0.0 {
                let mut rng = rand::rng();
                let jitter: f64 = rng.random_range(-range..=range);
                ((delay as f64) + jitter).max(0.0) as u64
            } else {
                delay
            }
        };

        Duration::from_secs(jittered)
    }
}

mod defaults {
    pub const fn base_delay_secs() -> u64 {
        400
    }

    pub const fn max_delay_secs() -> u64 {
        14400 // 4 hours
    }

    pub const fn jitter_factor() -> f64 {
        0.1 // ±10%
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_retry_without_jitter() {
        let policy = BackoffPolicy {
            base_delay_secs: 100,
            max_delay_secs: 14400,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay(1).as_secs(), 100);
        assert_eq!(policy.delay(2).as_secs(), 200);
        assert_eq!(policy.delay(3).as_secs(), 400);
        assert_eq!(policy.delay(4).as_secs(), 800);
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy {
            base_delay_secs: 100,
            max_delay_secs: 1000,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.delay(20).as_secs(), 1000);
        assert_eq!(policy.delay(64).as_secs(), 1000);
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = BackoffPolicy {
            base_delay_secs: 100,
            max_delay_secs: 14400,
            jitter_factor: 0.2,
        };

        for _ in 0..32 {
            let delay = policy.delay(2).as_secs();
            assert!((160..=240).contains(&delay), "delay {delay} out of range");
        }
    }
}
