//! Exponential backoff for failed external calls.
//!
//! Delays grow as `initial * 2^n`, are capped at `max`, and carry an upward-only
//! jitter of at most `jitter_ratio * base` with `jitter_ratio` in [0, 1]. Since the
//! next base is double the previous one, a jittered delay never exceeds the next
//! unjittered one, so consecutive delays are non-decreasing and plateau at `max`.
use rand::Rng;
use std::time::Duration;

/// Calculate the unjittered delay for the `consecutive_count`-th retry (0-based).
///
/// Returns `initial_delay * 2^consecutive_count`, capped at `max_delay`.
pub fn backoff_delay(initial_delay: Duration, consecutive_count: u32, max_delay: Duration) -> Duration {
    let shift = 1u32.checked_shl(consecutive_count).unwrap_or(u32::MAX);
    initial_delay.saturating_mul(shift).min(max_delay)
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    consecutive: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            initial,
            max,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            consecutive: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt; advances the failure count.
    pub fn next_delay(&mut self) -> Duration {
        let base = backoff_delay(self.initial, self.consecutive, self.max);
        let jitter = if self.jitter_ratio > 0.0 && !base.is_zero() {
            base.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter_ratio))
        } else {
            Duration::ZERO
        };
        // The max() guard keeps the sequence monotone even if rounding nudges a
        // jittered delay past the next base.
        let delay = (base + jitter).min(self.max).max(self.last);
        self.consecutive = self.consecutive.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Forget past failures after a success.
    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.last = Duration::ZERO;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
