//! Capped exponential retry-delay counter.
//!
//! The coordinator keeps one of these per retry schedule: each failure grows
//! the delay geometrically up to a ceiling, a success resets it, and errors
//! that retrying soon cannot fix jump straight to the ceiling.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: u32,
    max: Duration,
    delay: Duration,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: u32, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            delay: Duration::ZERO,
        }
    }

    /// The current delay, without mutating state. Zero until the first
    /// failure is recorded.
    pub fn peek(&self) -> Duration {
        self.delay
    }

    /// Record a failure and return the new delay.
    pub fn backoff(&mut self) -> Duration {
        self.delay = if self.delay.is_zero() {
            self.base
        } else {
            self.delay.saturating_mul(self.multiplier)
        };
        if self.delay > self.max {
            self.delay = self.max;
        }
        self.delay
    }

    /// Jump straight to the maximum delay. Used for failures where retrying
    /// sooner cannot help until the user acts.
    pub fn max_out(&mut self) {
        self.delay = self.max;
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}
