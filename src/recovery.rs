use crate::error::FieldcamError;
use std::time::Duration;
use tracing::{info, warn};

/// Exponential retry delay configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Per-component exponential backoff for recoverable failures.
///
/// The capture loop owns one of these for the camera: every failed open
/// doubles the pause before the next cycle, and a successful cycle resets it.
#[derive(Debug)]
pub struct RetryBackoff {
    component: &'static str,
    config: RetryConfig,
    failures: u32,
}

impl RetryBackoff {
    pub fn new(component: &'static str, config: RetryConfig) -> Self {
        Self {
            component,
            config,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn on_failure(&mut self, error: &FieldcamError) -> Duration {
        let delay = self.calculate_delay(self.failures);
        self.failures = self.failures.saturating_add(1);

        warn!(
            "{} failure #{} ({}), retrying in {:?}",
            self.component, self.failures, error, delay
        );

        delay
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        if self.failures > 0 {
            info!(
                "{} recovered after {} failed attempt(s)",
                self.component, self.failures
            );
        }
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn calculate_delay(&self, failures: u32) -> Duration {
        let factor = 2_u64.saturating_pow(failures.min(32));
        let delay_ms = (self.config.base_delay.as_millis() as u64).saturating_mul(factor);
        let delay = Duration::from_millis(delay_ms);

        if delay > self.config.max_delay {
            self.config.max_delay
        } else {
            delay
        }
    }
}
