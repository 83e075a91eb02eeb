use std::time::Duration;

use rand::prelude::*;
use renderconfig::SchedulerConfig;

/// Capped exponential backoff: `min(base * 2^(retry - 1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    jitter: f32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: 0.0,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap).with_jitter(config.backoff_jitter)
    }

    pub fn with_jitter(mut self, jitter: f32) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the `retry_count`-th retry (1-based). Never exceeds the cap.
    pub fn delay(&self, retry_count: u32, rng: &mut StdRng) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let raw = self.base.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.cap);
        if self.jitter <= 0.0 {
            return capped;
        }
        let extra = capped.mul_f32(rng.gen_range(0.0..=self.jitter));
        (capped + extra).min(self.cap)
    }
}
