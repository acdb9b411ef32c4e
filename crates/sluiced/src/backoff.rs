//! Exponential reconnect backoff with jitter, shared by both transports.
//!
//! The base delay doubles per consecutive failure from the configured
//! initial to the cap; each scheduled delay gets ±10% jitter and is clamped
//! to the cap. A successful connect resets the sequence.

use std::time::Duration;

use rand::Rng;

/// Jitter applied to every delay.
const JITTER: f64 = 0.10;

#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    /// Consecutive failures since the last reset.
    consecutive: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            consecutive: 0,
        }
    }

    /// Forget all failures. Called on successful connect.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// True while the base delay has not grown past the initial value.
    /// Drives the fast/slow advertising parameter choice.
    pub fn is_baseline(&self) -> bool {
        self.consecutive <= 1
    }

    /// Record a failure and return the next delay to wait.
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive += 1;
        let base = self.base_for(self.consecutive);
        let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        base.mul_f64(factor).min(self.max)
    }

    /// Undithered base delay for the nth consecutive failure (1-based).
    pub(crate) fn base_for(&self, attempt: u32) -> Duration {
        let mut base = self.initial;
        for _ in 1..attempt {
            base = (base * 2).min(self.max);
            if base == self.max {
                break;
            }
        }
        base
    }
}
