use rand::prelude::*;
use std::cell::RefCell;
use tokio::time::Duration;

thread_local! {
    static THREAD_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`.
///
/// With jitter enabled the delay is drawn uniformly from `0..=capped`
/// ("full jitter"). Without jitter the delay is exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryDelay {
    base_delay_ms: u64,
    multiplier: f64,
    max_delay_ms: u64,
    jitter: bool,
}

impl RetryDelay {
    /// Creates a doubling, jittered backoff between `base_delay_ms` and `max_delay_ms`
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            multiplier: 2.0,
            max_delay_ms,
            jitter: true,
        }
    }

    /// Creates an exact (unjittered) exponential backoff
    pub fn exponential(base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            multiplier,
            max_delay_ms,
            jitter: false,
        }
    }

    pub fn with_jitter(self, jitter: bool) -> Self {
        Self { jitter, ..self }
    }

    pub fn with_base_delay(self, base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            ..self
        }
    }

    pub fn has_jitter(&self) -> bool {
        self.jitter
    }

    /// Returns the configured base delay in milliseconds
    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the configured maximum delay in milliseconds
    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Calculates the delay before retry number `retry_count` (zero based).
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry_count.min(i32::MAX as u32) as i32);
        let exp_delay = (self.base_delay_ms as f64 * factor).min(u64::MAX as f64) as u64;

        let capped_delay = exp_delay.min(self.max_delay_ms);

        if !self.jitter {
            return Duration::from_millis(capped_delay);
        }

        let jittered_delay =
            THREAD_RNG.with(|rng| rng.borrow_mut().random_range(0..=capped_delay));

        Duration::from_millis(jittered_delay)
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 30_000, // 30 seconds max delay
            jitter: true,
        }
    }
}
