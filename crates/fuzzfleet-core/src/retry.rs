//! Injectable retry policy shared by every retrying client.
//!
//! The policy is plain data so tests can shrink every delay to zero and
//! deployments can tune it from configuration; no client hardcodes its
//! own timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Exponential-backoff parameters consulted by every retrying client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// First delay after a failed attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: f64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Inner attempts a client makes before escalating (for the
    /// control-plane client, escalation means a tunnel health check).
    pub attempts_before_escalation: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            attempts_before_escalation: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy with zero delays, for tests that exercise retry loops.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            attempts_before_escalation: 3,
        }
    }

    /// Validate internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the multiplier would shrink delays,
    /// the cap is below the base delay, or the escalation budget is
    /// zero.
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "retry max_delay_ms ({}) below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if self.attempts_before_escalation == 0 {
            return Err(Error::InvalidConfig(
                "retry attempts_before_escalation must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Base delay as a [`Duration`].
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Start a fresh backoff sequence.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            delay: Duration::from_millis(self.base_delay_ms),
            max: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// One in-progress exponential backoff sequence.
///
/// Each `wait` sleeps for the current delay, then grows it by the
/// policy multiplier up to the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// The delay the next `wait` will sleep for.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.delay
    }

    /// Sleep for the current delay, then advance it.
    pub async fn wait(&mut self) {
        tokio::time::sleep(self.delay).await;
        self.advance();
    }

    fn advance(&mut self) {
        let next = self.delay.mul_f64(self.multiplier);
        self.delay = next.min(self.max);
    }
}
