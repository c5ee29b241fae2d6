use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
};

/// Bounded exponential backoff: `delay(n) = min(base * 2^n, max)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        )
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay before the next retry, consuming one attempt; `None` once exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
