//! Retry policy for pipeline stages
//!
//! Exponential backoff with a cap, ±jitter so a burst of failing seals does
//! not retry in lockstep, and a hard attempt limit after which the seal is
//! failed with `RetriesExhausted`.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Stage retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts per stage
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the backoff, applied in both directions
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// What to do after a retryable failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again no earlier than `at`; `attempt` is the new retry count
    RetryAt { attempt: u32, at: DateTime<Utc> },
    /// Out of attempts
    Exhausted,
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed), without jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff with jitter applied, never above `max_backoff`
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_for_attempt(attempt).as_secs_f64();
        if self.jitter <= 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter;
        let jittered = rand::rng().random_range((base - spread)..=(base + spread));
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_backoff.as_secs_f64()))
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide the next step for a record that has already retried
    /// `retry_count` times in its current stage.
    pub fn decide(&self, retry_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if !self.should_retry(retry_count) {
            return RetryDecision::Exhausted;
        }
        let backoff = self.jittered_backoff(retry_count);
        RetryDecision::RetryAt {
            attempt: retry_count + 1,
            at: now + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    /// Check if a record is ready for retry based on retry_after
    pub fn is_ready_for_retry(&self, retry_after: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match retry_after {
            Some(time) => now >= time,
            None => true,
        }
    }
}
