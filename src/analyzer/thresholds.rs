//! Per-metric safety thresholds
//!
//! A [`Threshold`] maps a reading onto a [`Severity`] tier. The default table
//! carries the limits the monitor ships with; configuration can override any
//! entry or add thresholds for metrics that have none.

use crate::events::{metric, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which side of the threshold is unhealthy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Readings at or above the limit breach it (load, temperature)
    #[default]
    Above,
    /// Readings at or below the limit breach it (frequency, free memory)
    Below,
}

/// Warning and critical limits for one metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
    /// Label used in the health record reason, e.g. "CPU Overheating"
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub direction: Direction,
}

impl Threshold {
    pub fn above(warning: f64, critical: f64, reason: &str) -> Self {
        Self {
            warning,
            critical,
            reason: Some(reason.to_string()),
            direction: Direction::Above,
        }
    }

    pub fn below(warning: f64, critical: f64, reason: &str) -> Self {
        Self {
            warning,
            critical,
            reason: Some(reason.to_string()),
            direction: Direction::Below,
        }
    }

    /// Severity tier of a single value against this threshold
    pub fn tier(&self, value: f64) -> Severity {
        if self.breaches(value, self.critical) {
            Severity::Critical
        } else if self.breaches(value, self.warning) {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }

    fn breaches(&self, value: f64, limit: f64) -> bool {
        match self.direction {
            Direction::Above => value >= limit,
            Direction::Below => value <= limit,
        }
    }

    /// Whether critical lies beyond warning in this threshold's direction
    pub fn is_ordered(&self) -> bool {
        if !self.warning.is_finite() || !self.critical.is_finite() {
            return false;
        }
        match self.direction {
            Direction::Above => self.critical >= self.warning,
            Direction::Below => self.critical <= self.warning,
        }
    }
}

/// Thresholds the monitor ships with
pub fn default_thresholds() -> BTreeMap<String, Threshold> {
    let mut table = BTreeMap::new();
    table.insert(
        metric::CPU_USAGE.to_string(),
        Threshold::above(80.0, 95.0, "CPU Overload"),
    );
    table.insert(
        metric::CPU_TEMP.to_string(),
        Threshold::above(80.0, 90.0, "CPU Overheating"),
    );
    table.insert(
        metric::GPU_USAGE.to_string(),
        Threshold::above(80.0, 95.0, "GPU Overload"),
    );
    table.insert(
        metric::GPU_TEMP.to_string(),
        Threshold::above(80.0, 90.0, "GPU Overheating"),
    );
    table.insert(
        metric::MEMORY_USAGE.to_string(),
        Threshold::above(85.0, 95.0, "Memory Pressure"),
    );
    table.insert(
        metric::SOFTIRQ_RATE.to_string(),
        Threshold::above(50_000.0, 100_000.0, "Kernel Stall"),
    );
    table.insert(
        metric::CONTEXT_SWITCH_RATE.to_string(),
        Threshold::above(100_000.0, 250_000.0, "Excessive Context Switching"),
    );
    table.insert(
        metric::INTERRUPT_RATE.to_string(),
        Threshold::above(100_000.0, 200_000.0, "Interrupt Storm"),
    );
    table.insert(
        metric::KERNEL_LATENCY_US.to_string(),
        Threshold::above(2_000.0, 10_000.0, "Kernel Latency"),
    );
    table
}
