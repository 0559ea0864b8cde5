//! Bounded exponential backoff for streaming reconnects.
//!
//! The delay starts at `initial`, grows by `multiplier` per attempt, and is
//! capped at `max`. Jitter only ever shortens a delay, so the schedule never
//! exceeds the cap. After `max_attempts` delays the schedule is exhausted.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_MS: u64 = 10_000;
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER: f64 = 0.2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Reconnect schedule parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction in `[0, 1)` of each delay that may be randomly shaved off.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_INITIAL_MS),
            max: Duration::from_millis(DEFAULT_MAX_MS),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Stateful iterator over reconnect delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0, current: config.initial }
    }

    /// Number of delays handed out so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay, or `None` once `max_attempts` delays have been issued.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;

        let base = self.current.min(self.config.max);
        // Overflowing or non-finite growth saturates at the cap.
        self.current = Duration::try_from_secs_f64(base.as_secs_f64() * self.config.multiplier)
            .map_or(self.config.max, |next| next.min(self.config.max));
        Some(apply_jitter(base, self.config.jitter))
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter.is_nan() || jitter <= 0.0 {
        return delay;
    }
    let shave = rand::rng().random_range(0.0..jitter.min(0.99));
    delay.mul_f64(1.0 - shave)
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
