//! # Fibonacci Backoff
//!
//! Delay between retries of a failing watch stream. Grows more slowly than
//! exponential backoff: 1s, 1s, 2s, 3s, 5s, 8s, ... capped at the maximum.

use std::time::Duration;

/// Fibonacci backoff calculator, in seconds.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum backoff value (for reset)
    min_seconds: u64,
    /// Previous backoff value
    prev_seconds: u64,
    /// Current backoff value
    current_seconds: u64,
    /// Maximum backoff value
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with the given bounds in seconds.
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        let min_seconds = min_seconds.max(1);
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds: max_seconds.max(min_seconds),
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;
        let next = self.prev_seconds.saturating_add(self.current_seconds);
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);
        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}
