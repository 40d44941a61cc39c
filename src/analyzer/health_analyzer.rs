use crate::analyzer::state::{HysteresisParams, MetricState};
use crate::analyzer::thresholds::Threshold;
use crate::config::AnalyzerConfig;
use crate::events::{HealthRecord, Sample, Severity};
use log::{debug, info};
use std::collections::{BTreeMap, HashMap};

/// Reason attached to records derived from degraded samples
pub const DEGRADED_REASON: &str = "Metric source unavailable";

/// Classifies samples into health records
///
/// The analyzer keeps one [`MetricState`] per metric name it has seen and is
/// the only owner of that state. Classification is deterministic: the same
/// sample applied to the same prior state always yields the same record.
#[derive(Debug, Clone)]
pub struct HealthAnalyzer {
    thresholds: BTreeMap<String, Threshold>,
    params: HysteresisParams,
    states: HashMap<String, MetricState>,
}

impl HealthAnalyzer {
    /// Create an analyzer from configuration
    ///
    /// # Example
    ///
    /// ```
    /// use kernel_health::analyzer::HealthAnalyzer;
    /// use kernel_health::config::AnalyzerConfig;
    /// use kernel_health::events::{metric, Sample, Severity};
    /// use chrono::Utc;
    ///
    /// let mut analyzer = HealthAnalyzer::new(&AnalyzerConfig::default());
    /// let record = analyzer.classify(&Sample::new(Utc::now()).with(metric::CPU_TEMP, 95.0));
    /// assert_eq!(record.overall, Severity::Critical);
    /// assert_eq!(record.reason.as_deref(), Some("CPU Overheating"));
    /// ```
    pub fn new(config: &AnalyzerConfig) -> Self {
        let params = HysteresisParams {
            smoothing_alpha: config.smoothing_alpha,
            downgrade_after: config.downgrade_after,
            warmup_samples: config.warmup_samples,
        };
        Self::with_thresholds(config.threshold_table(), params)
    }

    /// Create an analyzer with an explicit threshold table
    pub fn with_thresholds(thresholds: BTreeMap<String, Threshold>, params: HysteresisParams) -> Self {
        info!(
            "HealthAnalyzer configured with {} thresholds (alpha={}, downgrade_after={})",
            thresholds.len(),
            params.smoothing_alpha,
            params.downgrade_after
        );
        Self {
            thresholds,
            params,
            states: HashMap::new(),
        }
    }

    /// Classify one sample
    ///
    /// Only metrics present in the sample appear in the record. Non-finite
    /// readings are treated as absent for this tick, and absent metrics keep
    /// their state untouched and contribute no severity.
    pub fn classify(&mut self, sample: &Sample) -> HealthRecord {
        if sample.degraded {
            debug!("Classifying degraded sample at {}", sample.timestamp);
            return HealthRecord {
                timestamp: sample.timestamp,
                metrics: BTreeMap::new(),
                overall: Severity::Normal,
                reason: Some(DEGRADED_REASON.to_string()),
                degraded: true,
            };
        }

        let mut metrics = BTreeMap::new();
        for (name, &value) in &sample.readings {
            if !value.is_finite() {
                debug!("Ignoring non-finite reading for '{}': {}", name, value);
                continue;
            }

            let state = self.states.entry(name.clone()).or_default();
            let health = state.observe(value, self.thresholds.get(name), &self.params);
            metrics.insert(name.clone(), health);
        }

        let overall = metrics
            .values()
            .map(|health| health.severity)
            .max()
            .unwrap_or(Severity::Normal);

        let reason = if overall.is_alert() {
            let mut labels: Vec<&str> = Vec::new();
            for (name, health) in &metrics {
                if health.severity != overall {
                    continue;
                }
                let label = self
                    .thresholds
                    .get(name)
                    .and_then(|t| t.reason.as_deref())
                    .unwrap_or(name.as_str());
                if !labels.contains(&label) {
                    labels.push(label);
                }
            }
            Some(labels.join(", "))
        } else {
            None
        };

        HealthRecord {
            timestamp: sample.timestamp,
            metrics,
            overall,
            reason,
            degraded: false,
        }
    }

    /// Retained state for a metric, if it has ever been seen
    pub fn state(&self, name: &str) -> Option<&MetricState> {
        self.states.get(name)
    }

    pub fn params(&self) -> &HysteresisParams {
        &self.params
    }
}
