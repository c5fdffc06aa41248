//! Geometric delay growth shared by the console and readiness loops.

use std::time::Duration;

/// A delay that starts at `initial` and is multiplied by `factor` on every
/// step, never exceeding `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    current: Duration,
    factor: f64,
    max: Duration,
}

impl Backoff {
    /// A `factor` below 1.0 is treated as 1.0.
    #[must_use]
    pub fn new(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            factor: factor.max(1.0),
            max,
        }
    }

    /// The delay to use now, without advancing.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the current delay and advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.factor).min(self.max);
        delay
    }
}
