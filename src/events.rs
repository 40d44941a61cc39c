//! Core data types shared across the pipeline
//!
//! This module defines the sample produced by the metric source, the health
//! record produced by the analyzer and the severity scale used to classify both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Well-known metric names produced by the host metric source
pub mod metric {
    /// Global CPU load, percent (0-100)
    pub const CPU_USAGE: &str = "cpu_usage";
    /// CPU package temperature, degrees Celsius
    pub const CPU_TEMP: &str = "cpu_temp";
    /// Average frequency across all cores, MHz
    pub const CPU_FREQ_MHZ: &str = "cpu_freq_mhz";
    /// Used memory, percent of total
    pub const MEMORY_USAGE: &str = "memory_usage";
    /// Context switches per second
    pub const CONTEXT_SWITCH_RATE: &str = "context_switch_rate";
    /// Hardware interrupts per second
    pub const INTERRUPT_RATE: &str = "interrupt_rate";
    /// Soft interrupts (deferred kernel work) per second
    pub const SOFTIRQ_RATE: &str = "softirq_rate";
    /// Overshoot of a short kernel timer sleep, microseconds
    pub const KERNEL_LATENCY_US: &str = "kernel_latency_us";
    /// GPU load, percent (0-100)
    pub const GPU_USAGE: &str = "gpu_usage";
    /// GPU temperature, degrees Celsius
    pub const GPU_TEMP: &str = "gpu_temp";
    /// Number of live processes
    pub const PROCESS_COUNT: &str = "process_count";

    /// Name of the per-core frequency metric for core `index`
    pub fn core_freq(index: usize) -> String {
        format!("core_freq_mhz.{}", index)
    }
}

/// Severity tier of a metric or of the whole host
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Within safe limits
    #[default]
    Normal,
    /// Elevated, worth watching
    Warning,
    /// Beyond the safety threshold
    Critical,
}

impl Severity {
    /// Whether this severity should be written to the log sink
    pub fn is_alert(self) -> bool {
        self > Severity::Normal
    }
}

/// One reading of every metric the source could read on a tick
///
/// Missing keys mean "not applicable" for that tick, never zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    /// When the sample was taken
    pub timestamp: Timestamp,
    /// Metric name to reading
    pub readings: BTreeMap<String, f64>,
    /// Set when the source failed and this sample only carries liveness
    #[serde(default)]
    pub degraded: bool,
}

impl Sample {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            readings: BTreeMap::new(),
            degraded: false,
        }
    }

    /// A liveness sample emitted when the source keeps failing
    pub fn degraded(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            readings: BTreeMap::new(),
            degraded: true,
        }
    }

    /// Builder-style helper to attach a reading
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.readings.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.readings.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.readings.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Classified state of a single metric on one tick
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricHealth {
    /// Reading as sampled
    pub value: f64,
    /// Smoothed reading after this tick
    pub smoothed: f64,
    /// Severity after hysteresis
    pub severity: Severity,
    /// How much history backs the smoothed value (0.0-1.0)
    pub confidence: f64,
}

/// Classified health of the host for one sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthRecord {
    /// Timestamp of the sample this record was derived from
    pub timestamp: Timestamp,
    /// Per-metric classification, only for metrics present in the sample
    pub metrics: BTreeMap<String, MetricHealth>,
    /// Maximum severity across `metrics`
    pub overall: Severity,
    /// Human-readable cause when `overall` is above normal
    pub reason: Option<String>,
    /// Derived from a degraded sample
    #[serde(default)]
    pub degraded: bool,
}

impl HealthRecord {
    /// The empty record a hub holds before the first publish
    pub fn initial(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            metrics: BTreeMap::new(),
            overall: Severity::Normal,
            reason: None,
            degraded: false,
        }
    }

    /// Per-metric severities, as written to the log sink
    pub fn severities(&self) -> BTreeMap<String, Severity> {
        self.metrics
            .iter()
            .map(|(name, health)| (name.clone(), health.severity))
            .collect()
    }

    pub fn severity_of(&self, name: &str) -> Option<Severity> {
        self.metrics.get(name).map(|health| health.severity)
    }
}

/// Static description of the monitored host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostInfo {
    pub host_name: String,
    pub os: String,
    pub kernel_version: String,
    pub cpu_brand: String,
    pub core_count: usize,
    pub total_memory_gb: f64,
}
