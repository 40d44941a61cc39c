//! Per-metric hysteresis state machine
//!
//! Upgrades follow the raw reading immediately. Downgrades need
//! `downgrade_after` consecutive samples whose raw and smoothed tiers are both
//! below the current severity; the metric then settles on the highest tier
//! seen during that recovery streak.

use crate::analyzer::thresholds::Threshold;
use crate::events::{MetricHealth, Severity};

/// Smoothing and hysteresis parameters shared by every metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisParams {
    /// Exponential moving average factor in (0, 1]
    pub smoothing_alpha: f64,
    /// Consecutive recovering samples needed to downgrade
    pub downgrade_after: u32,
    /// Samples needed for full confidence
    pub warmup_samples: u32,
}

impl Default for HysteresisParams {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.5,
            downgrade_after: 3,
            warmup_samples: 3,
        }
    }
}

/// Running state of one metric, owned by the analyzer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricState {
    smoothed: Option<f64>,
    samples_seen: u64,
    severity: Severity,
    consecutive_breaches: u32,
    recovery_streak: u32,
    streak_peak: Severity,
}

impl MetricState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn smoothed(&self) -> Option<f64> {
        self.smoothed
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    /// Consecutive samples whose raw reading was above the normal tier
    pub fn consecutive_breaches(&self) -> u32 {
        self.consecutive_breaches
    }

    /// Consecutive samples counted toward the next downgrade
    pub fn recovery_streak(&self) -> u32 {
        self.recovery_streak
    }

    /// Confidence in the smoothed value, 0.0 before the first reading
    pub fn confidence(&self, warmup_samples: u32) -> f64 {
        let warmup = u64::from(warmup_samples.max(1));
        self.samples_seen.min(warmup) as f64 / warmup as f64
    }

    /// Fold one finite reading into the state
    ///
    /// Metrics without a threshold are smoothed but always stay normal.
    pub fn observe(
        &mut self,
        value: f64,
        threshold: Option<&Threshold>,
        params: &HysteresisParams,
    ) -> MetricHealth {
        let smoothed = match self.smoothed {
            Some(previous) => previous + params.smoothing_alpha * (value - previous),
            None => value,
        };
        self.smoothed = Some(smoothed);
        self.samples_seen += 1;

        if let Some(threshold) = threshold {
            let raw_tier = threshold.tier(value);
            let smoothed_tier = threshold.tier(smoothed);
            self.step(raw_tier, smoothed_tier, params.downgrade_after);
        }

        MetricHealth {
            value,
            smoothed,
            severity: self.severity,
            confidence: self.confidence(params.warmup_samples),
        }
    }

    fn step(&mut self, raw_tier: Severity, smoothed_tier: Severity, downgrade_after: u32) {
        if raw_tier > Severity::Normal {
            self.consecutive_breaches = self.consecutive_breaches.saturating_add(1);
        } else {
            self.consecutive_breaches = 0;
        }

        if raw_tier > self.severity {
            self.severity = raw_tier;
            self.reset_streak();
            return;
        }

        if raw_tier < self.severity && smoothed_tier < self.severity {
            let tier = raw_tier.max(smoothed_tier);
            self.streak_peak = if self.recovery_streak == 0 {
                tier
            } else {
                self.streak_peak.max(tier)
            };
            self.recovery_streak += 1;

            if self.recovery_streak >= downgrade_after {
                self.severity = self.streak_peak;
                self.reset_streak();
            }
        } else {
            self.reset_streak();
        }
    }

    fn reset_streak(&mut self) {
        self.recovery_streak = 0;
        self.streak_peak = Severity::Normal;
    }
}
