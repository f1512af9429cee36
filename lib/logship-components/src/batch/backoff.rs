use std::time::Duration;

use logship_config::BackoffConfiguration;

/// An exponential backoff strategy.
///
/// Backoff durations double with every consecutive error, starting at the minimum backoff, and never exceed the maximum
/// backoff.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given minimum and maximum backoff durations.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff,
        }
    }

    /// Calculates the backoff duration for the given error count.
    ///
    /// An error count of zero yields the minimum backoff.
    pub fn get_backoff_duration(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return self.min_backoff;
        }

        let backoff = self.min_backoff.saturating_mul(2u32.saturating_pow(error_count));

        // Not `clamp`, which panics on inverted bounds.
        backoff.min(self.max_backoff).max(self.min_backoff)
    }
}

/// Retry bookkeeping for a single batch.
#[derive(Debug)]
pub struct RetryState {
    backoff: ExponentialBackoff,
    max_retries: u32,
    attempt: u32,
}

impl RetryState {
    /// Creates a fresh `RetryState` for the given retry policy.
    pub fn new(config: &BackoffConfiguration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(config.min_backoff, config.max_backoff),
            max_retries: config.max_retries,
            attempt: 0,
        }
    }

    /// Number of failed attempts recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records a failed attempt.
    ///
    /// Returns how long to wait before the next attempt, or `None` if the retry budget is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }

        let delay = self.backoff.get_backoff_duration(self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}
