//! Exponential reconnect backoff with jitter
//!
//! ```text
//! nominal[n] = min * multiplier^(n-1)
//! delay[n]   = max(delay[n-1], min(max, nominal[n] * (1 + jitter * U[0,1))))
//! ```
//!
//! Delays never decrease between resets and never exceed `max`. Jitter
//! spreads reconnects of a fleet that lost the broker at the same moment.

use crate::config::BackoffConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Reconnect delay controller; reset after every successful connect
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last_delay: Option<Duration>,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Reproducible jitter sequence
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BackoffConfig, rng: StdRng) -> Self {
        Self {
            config,
            attempt: 0,
            last_delay: None,
            rng,
        }
    }

    /// Un-jittered delay for `attempt` (1-based), capped at the maximum
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.config.min.as_secs_f64() * self.config.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.config.max.as_secs_f64() {
            self.config.max
        } else {
            Duration::from_secs_f64(secs).max(self.config.min)
        }
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let nominal = self.nominal_delay(self.attempt);

        let factor = 1.0 + self.config.jitter * self.rng.gen::<f64>();
        let jittered = nominal
            .mul_f64(factor)
            .min(self.config.max)
            .max(self.config.min);
        let delay = match self.last_delay {
            Some(last) => jittered.max(last),
            None => jittered,
        };

        self.last_delay = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = None;
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn min_delay(&self) -> Duration {
        self.config.min
    }

    pub fn max_delay(&self) -> Duration {
        self.config.max
    }
}
