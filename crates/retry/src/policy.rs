//! Retry configuration and backoff math.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use taskforge_core::{ConfigError, ConfigResult};

/// Capped exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor between consecutive retries
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); the delay moves by up to this fraction either way
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Constant delay between retries, no jitter.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter_factor: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                format!("must be a finite value >= 1.0, got {}", self.multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(
                "jitter_factor",
                format!("must be within 0.0..=1.0, got {}", self.jitter_factor),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "initial_delay",
                "must not exceed max_delay",
            ));
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ns = self.initial_delay.as_nanos() as f64;
        let max_ns = self.max_delay.as_nanos() as f64;
        let exp = self.multiplier.powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay_ns = base_ns * exp;

        if !delay_ns.is_finite() || delay_ns >= max_ns {
            return self.max_delay;
        }
        Duration::from_nanos(delay_ns.round() as u64)
    }

    /// Delay before retry number `retry` with random jitter applied.
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let u = rand::thread_rng().gen_range(-1.0..=1.0);
        self.apply_jitter(self.delay_for_retry(retry), u)
    }

    /// Perturb `delay` by `delay * jitter_factor * u`, clamped at zero.
    pub(crate) fn apply_jitter(&self, delay: Duration, u: f64) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let ns = delay.as_nanos() as f64;
        let jittered = ns + ns * self.jitter_factor * u;
        Duration::from_nanos(jittered.max(0.0).round() as u64)
    }
}
