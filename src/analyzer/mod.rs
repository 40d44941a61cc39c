//! Health classification
//!
//! Turns raw samples into [`HealthRecord`](crate::events::HealthRecord)s using
//! per-metric thresholds, exponential smoothing and downgrade hysteresis.

pub mod health_analyzer;
pub mod state;
pub mod thresholds;

pub use health_analyzer::{HealthAnalyzer, DEGRADED_REASON};
pub use state::{HysteresisParams, MetricState};
pub use thresholds::{default_thresholds, Direction, Threshold};
