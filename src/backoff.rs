//! Bounded exponential backoff for telemetry reconnects.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Delay generator: `initial * multiplier^attempt`, capped at `max_delay`.
///
/// With jitter enabled each delay is drawn uniformly from `[d/2, d]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out since the last [`reset`](Self::reset).
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Undithered delay for the current attempt.
    pub fn base_delay(&self) -> Duration {
        let exponent = self.attempt.min(i32::MAX as u32) as i32;
        let scaled = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = scaled.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        if !self.config.jitter || base.is_zero() {
            return base;
        }
        let secs = base.as_secs_f64();
        Duration::from_secs_f64(rand::thread_rng().gen_range(secs / 2.0..=secs))
    }
}
