//! Exponential backoff with jitter, bounded by a deadline.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Exponential delay for `attempt` (1-based), capped at `max_ms`, plus up to
/// 10% jitter. Attempt 0 yields no delay.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt - 1))
        .min(max_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms + jitter)
}

/// Polling schedule that gives up once its deadline passes.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    base_ms: u64,
    max_ms: u64,
    deadline: Instant,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, budget: Duration) -> Self {
        Self {
            attempt: 0,
            base_ms,
            max_ms,
            deadline: Instant::now() + budget,
        }
    }

    /// Sleep before the next poll. Returns `false` without sleeping once the
    /// deadline has passed; the last sleep is truncated to the deadline.
    pub async fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        self.attempt = self.attempt.saturating_add(1);
        let delay = calculate_backoff(self.attempt, self.base_ms, self.max_ms);
        tokio::time::sleep_until((now + delay).min(self.deadline)).await;
        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
