//! Reconnect backoff: timer-free delay computation.

use std::time::Duration;

/// Retry schedule for the reconnect controller.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Multiplicative growth between consecutive delays
    pub factor: f64,
    /// First delay, and the lower bound for every delay
    pub min_timeout: Duration,
    /// Upper bound for every delay
    pub max_timeout: Duration,
    /// Spread each delay uniformly across one to two times its base value
    pub randomize: bool,
    /// Attempt limit; `None` retries indefinitely
    pub retries: Option<u32>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            factor: 1.5,
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(60),
            randomize: true,
            retries: None,
        }
    }
}

/// Backoff state for one reconnect cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    options: RetryOptions,
    attempt: u32,
}

impl Backoff {
    /// Fresh cycle; no attempts consumed.
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            attempt: 0,
        }
    }

    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are
    /// exhausted.
    ///
    /// `random` must be uniform in `[0, 1)`; it is injected so schedules
    /// stay deterministic under test.
    pub fn next_delay(&mut self, random: f64) -> Option<Duration> {
        if let Some(limit) = self.options.retries {
            if self.attempt >= limit {
                return None;
            }
        }
        let spread = if self.options.randomize {
            1.0 + random
        } else {
            1.0
        };
        let base = self.options.min_timeout.as_secs_f64()
            * self.options.factor.powi(self.attempt.min(i32::MAX as u32) as i32);
        let capped = (spread * base).min(self.options.max_timeout.as_secs_f64());
        self.attempt += 1;
        Some(Duration::try_from_secs_f64(capped).unwrap_or(self.options.max_timeout))
    }
}
