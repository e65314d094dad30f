//! Reconnect backoff.

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with uniform jitter.
///
/// Base delays run `min, 2*min, 4*min, ...` up to `max`; each delay adds a
/// jitter drawn uniformly from `[0, min)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(32))
    }
}

impl Backoff {
    /// Create a backoff starting at `min` and capped at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            next: min,
        }
    }

    /// Next base delay, without jitter.
    pub fn next_base(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Next delay including jitter.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.next_base() + self.min.mul_f64(jitter)
    }

    /// Start over from the minimum delay.
    pub fn reset(&mut self) {
        self.next = self.min;
    }
}
