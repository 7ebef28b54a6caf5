//! Adaptive concurrency controller.
//!
//! Load averages are noisy; reacting to single samples would thrash
//! agent counts. The controller therefore requires a streak of
//! consecutive out-of-band samples before it adjusts anything, and a
//! single sample back inside the neutral band cancels any partial
//! streak. Pushes are additionally rate-limited by a minimum
//! inter-adjustment interval to bound control-plane call volume.
//!
//! The state machine is pure: it consumes load samples and emits the
//! new runner/evaluator targets when a push is due. The job handle
//! owns the actual control-plane calls.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Controller tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Whether the controller pushes adjustments at all. Off by
    /// default; statistics collection is unaffected either way.
    pub enabled: bool,
    /// Load average above which the host is considered overloaded.
    pub load_high: f64,
    /// Load average below which the host is considered underloaded.
    pub load_low: f64,
    /// Consecutive out-of-band samples required before adjusting.
    pub streak_min: u32,
    /// Minimum spacing between two pushed adjustments, in seconds.
    pub min_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            load_high: 15.8,
            load_low: 14.3,
            streak_min: 6,
            min_interval_secs: 60,
        }
    }
}

impl ControllerConfig {
    /// Validate internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the neutral band is empty or the
    /// streak requirement is zero.
    pub fn validate(&self) -> Result<()> {
        if self.load_low >= self.load_high {
            return Err(Error::InvalidConfig(format!(
                "controller load_low ({}) must be below load_high ({})",
                self.load_low, self.load_high
            )));
        }
        if self.streak_min == 0 {
            return Err(Error::InvalidConfig(
                "controller streak_min must be at least 1".into(),
            ));
        }
        Ok(())
    }

    const fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }
}

/// New agent targets to push to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    /// New runner target.
    pub runners: u32,
    /// New evaluator target.
    pub evaluators: u32,
}

/// Hysteresis state machine tracking one job's runner/evaluator
/// targets against observed host load.
#[derive(Debug)]
pub struct Controller {
    config: ControllerConfig,
    high_streak: u32,
    low_streak: u32,
    runners: u32,
    evaluators: u32,
    last_push: Option<Instant>,
}

impl Controller {
    /// Create a controller seeded with the job's initial targets.
    #[must_use]
    pub const fn new(config: ControllerConfig, runners: u32, evaluators: u32) -> Self {
        Self {
            config,
            high_streak: 0,
            low_streak: 0,
            runners,
            evaluators,
            last_push: None,
        }
    }

    /// Current runner/evaluator targets.
    #[must_use]
    pub const fn counts(&self) -> (u32, u32) {
        (self.runners, self.evaluators)
    }

    /// Feed one load sample. Returns the targets to push when an
    /// adjustment is due, `None` otherwise.
    ///
    /// A completed streak is held (not reset) while the inter-
    /// adjustment gate is closed, so the push happens at the first
    /// eligible sample instead of discarding the evidence.
    pub fn observe(&mut self, load: f64, now: Instant) -> Option<Adjustment> {
        if load > self.config.load_high {
            self.low_streak = 0;
            self.high_streak = (self.high_streak + 1).min(self.config.streak_min);
            if self.high_streak >= self.config.streak_min && self.gate_open(now) {
                self.runners = self.runners.saturating_sub(1);
                self.evaluators = self.evaluators.saturating_sub(1);
                return self.push(now);
            }
            None
        } else if load < self.config.load_low {
            self.high_streak = 0;
            self.low_streak = (self.low_streak + 1).min(self.config.streak_min);
            if self.low_streak >= self.config.streak_min && self.gate_open(now) {
                self.runners += 1;
                self.evaluators += 1;
                return self.push(now);
            }
            None
        } else {
            // One neutral reading forgives any partial streak.
            self.high_streak = 0;
            self.low_streak = 0;
            None
        }
    }

    fn push(&mut self, now: Instant) -> Option<Adjustment> {
        self.high_streak = 0;
        self.low_streak = 0;
        self.last_push = Some(now);
        Some(Adjustment {
            runners: self.runners,
            evaluators: self.evaluators,
        })
    }

    fn gate_open(&self, now: Instant) -> bool {
        self.last_push
            .map_or(true, |last| now.duration_since(last) >= self.config.min_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        ControllerConfig {
            enabled: true,
            load_high: 15.8,
            load_low: 14.3,
            streak_min: 6,
            min_interval_secs: 0,
        }
    }

    #[test]
    fn test_config_rejects_empty_neutral_band() {
        let bad = ControllerConfig {
            load_high: 10.0,
            load_low: 10.0,
            ..ControllerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_six_high_samples_trigger_exactly_one_decrement() {
        let mut controller = Controller::new(config(), 10, 10);
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(controller.observe(16.0, now), None);
        }
        assert_eq!(
            controller.observe(16.0, now),
            Some(Adjustment {
                runners: 9,
                evaluators: 9
            })
        );
        // Streak was consumed; the next high sample starts over.
        assert_eq!(controller.observe(16.0, now), None);
    }

    #[test]
    fn test_neutral_sample_resets_streak() {
        let mut controller = Controller::new(config(), 10, 10);
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(controller.observe(16.0, now), None);
        }
        // Inside the neutral band: cancels the five high samples.
        assert_eq!(controller.observe(14.5, now), None);
        for _ in 0..5 {
            assert_eq!(controller.observe(16.0, now), None);
        }
        assert!(controller.observe(16.0, now).is_some());
    }

    #[test]
    fn test_low_samples_increment() {
        let mut controller = Controller::new(config(), 10, 10);
        let now = Instant::now();
        for _ in 0..5 {
            assert_eq!(controller.observe(10.0, now), None);
        }
        assert_eq!(
            controller.observe(10.0, now),
            Some(Adjustment {
                runners: 11,
                evaluators: 11
            })
        );
    }

    #[test]
    fn test_high_sample_clears_low_streak() {
        let mut controller = Controller::new(config(), 10, 10);
        let now = Instant::now();
        for _ in 0..5 {
            controller.observe(10.0, now);
        }
        controller.observe(16.0, now);
        for _ in 0..5 {
            assert_eq!(controller.observe(10.0, now), None);
        }
        assert!(controller.observe(10.0, now).is_some());
    }

    #[test]
    fn test_counts_never_go_below_zero() {
        let mut controller = Controller::new(config(), 0, 0);
        let now = Instant::now();
        for _ in 0..6 {
            controller.observe(16.0, now);
        }
        assert_eq!(controller.counts(), (0, 0));
    }

    #[test]
    fn test_min_interval_gates_pushes_and_holds_streak() {
        let mut gated = config();
        gated.min_interval_secs = 3600;
        let mut controller = Controller::new(gated, 10, 10);
        let now = Instant::now();
        for _ in 0..6 {
            controller.observe(10.0, now);
        }
        assert_eq!(controller.counts(), (11, 11));
        // Second streak completes while the gate is closed: held, not
        // pushed and not discarded.
        for _ in 0..10 {
            assert_eq!(controller.observe(10.0, now), None);
        }
        assert_eq!(controller.counts(), (11, 11));
        // One sample after the interval elapses is enough.
        let later = now + Duration::from_secs(3600);
        assert_eq!(
            controller.observe(10.0, later),
            Some(Adjustment {
                runners: 12,
                evaluators: 12
            })
        );
    }
}
