//! Reconnect policy: fixed exponential back-off (1 s, 2 s, 4 s), three
//! attempts, then the pending call fails with a typed error.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_attempts: u32,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 2,
            max_attempts: 3,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay * self.backoff_factor.pow(attempt)
    }

    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
