//! Reconnect backoff policy
//!
//! A single policy type covers both the exponential "connect failed" retry
//! loop and the fixed-interval "stream dropped mid-playback" detector; the
//! latter is just a multiplier of 1.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry schedule: `delay(n) = min(initial * multiplier^n, max)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry (ms)
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Growth factor applied per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on any single delay (ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Number of consecutive failures after which retrying stops
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackoffPolicy {
    /// Exponential policy with an explicit retry budget
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay_ms: initial.as_millis() as u64,
            multiplier,
            max_delay_ms: max.as_millis() as u64,
            max_retries,
        }
    }

    /// Fixed-interval policy (multiplier 1)
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            multiplier: 1.0,
            max_delay_ms: ms,
            max_retries,
        }
    }

    /// Bounded policy used to detect a stream that dropped mid-playback
    pub fn playback_drop() -> Self {
        Self::fixed(Duration::from_millis(5000), 3)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay to wait before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay_ms as f64;
        let cap = self.max_delay_ms as f64;
        // Multiplier below 1 would make the schedule shrink
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let raw = initial * factor;
        let ms = if raw.is_finite() { raw.min(cap) } else { cap };
        Duration::from_millis(ms.max(0.0) as u64)
    }

    /// Whether another retry is allowed after `failures` consecutive failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_retries
    }
}
