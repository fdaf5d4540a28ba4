//! Delay between phase retries
//!
//! Bounded exponential: `initial * multiplier^retry`, capped at `max`, with
//! optional ±25% jitter applied after the cap.

use common::BackoffConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    jitter: bool,
}

impl RetryBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier.max(1.0),
            max: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `retry` (0 is the wait after the first failed attempt)
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.multiplier.powi(retry.min(64) as i32);
        let capped = Duration::from_millis(base.min(self.max.as_millis() as f64) as u64);
        if self.jitter {
            Self::add_jitter(capped)
        } else {
            capped
        }
    }

    fn add_jitter(delay: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}
