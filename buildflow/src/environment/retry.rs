//! Environment recreation bound and backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for recreation delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to avoid recreating many environments in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// How often and how quickly a failed environment is recreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecreationPolicy {
    /// Recreations after the first attempt. N retries allow N+1 attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before a recreation, in milliseconds.
    #[serde(default)]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

const fn default_max_retries() -> u32 {
    1
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RecreationPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: 0,
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RecreationPolicy {
    /// Creates a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of recreations.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Delay before the recreation numbered `retry` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}
