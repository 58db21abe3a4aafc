//! Exponential reconnect backoff.
//!
//! Delays grow by `multiplier` after every use and saturate at `max`.  The
//! sequence is non-decreasing until [`Backoff::reset`] brings it back to
//! `min`, which the connection manager does on every successful connect.

use std::time::Duration;

/// Default first delay.
pub const DEFAULT_MIN: Duration = Duration::from_secs(1);
/// Default delay cap.
pub const DEFAULT_MAX: Duration = Duration::from_secs(60);
pub const DEFAULT_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    multiplier: u32,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN, DEFAULT_MAX, DEFAULT_MULTIPLIER)
    }
}

impl Backoff {
    /// `max` is raised to `min` if smaller; a multiplier below 1 is treated
    /// as 1.
    pub fn new(min: Duration, max: Duration, multiplier: u32) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            multiplier: multiplier.max(1),
            current: min,
        }
    }

    /// The delay to wait now; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    /// The delay the next call to [`next_delay`][Self::next_delay] returns.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
