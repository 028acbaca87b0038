// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use rand::Rng;

/// Bound and pacing for retrying transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, the first one included.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before try `attempt + 1`, where `attempt` starts at 1.
    /// Exponential, capped at `max`, with the upper half jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max);
        let floor = ceiling / 2;
        if ceiling <= floor {
            return ceiling;
        }
        let mut rng = rand::rng();
        let extra = rng.random_range(0..=(ceiling - floor).as_millis() as u64);
        floor + Duration::from_millis(extra)
    }

    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
        };
        for _ in 0..50 {
            let first = policy.delay(1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
            let third = policy.delay(3);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));
            assert!(policy.delay(12) <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn zero_base_never_waits() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::ZERO,
            max: Duration::ZERO,
        };
        assert_eq!(policy.delay(2), Duration::ZERO);
    }

    #[test]
    fn attempt_bound() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }
}
