//! Retry policy for optimistic-concurrency conflicts

use rand::Rng;
use std::time::Duration;

/// Bounded retry with capped exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts per reconcile, including the first
    pub max_attempts: u32,
    /// Backoff after the first failed attempt
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Backoff to wait after failed attempt number `attempt` (1-based), with up to 50% jitter
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(attempt.saturating_sub(1));
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max_backoff.as_millis() as u64);
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff_ms / 2);
        Duration::from_millis(backoff_ms + jitter_ms).min(self.max_backoff)
    }
}
