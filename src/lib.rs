//! Real-time kernel health telemetry
//!
//! A sampler reads host and kernel counters at a fixed interval, the analyzer
//! smooths them and classifies each metric with hysteresis, and the hub fans
//! the resulting records out to authorized subscribers with per-subscriber
//! backpressure. Warning and critical records are also appended to a log sink.

/// Error types for every pipeline stage
pub mod error;

/// Samples, severities and health records
pub mod events;

/// Configuration management
pub mod config;

/// Metric source adapter and sampler
pub mod collectors;

/// Smoothing, thresholds and hysteresis
pub mod analyzer;

/// Broadcast hub, history and subscriber queues
pub mod hub;

/// Session gate consulted before admitting subscribers
pub mod gate;

/// Alert log sink and its dispatcher
pub mod alerts;

/// Self-monitoring counters
pub mod stats;

/// Pipeline wiring and lifecycle
pub mod monitor;

/// WebSocket live feed
pub mod feed;

// Re-export commonly used types
pub use error::{
    ConfigError, FeedError, GateError, HubError, LogSinkError, MonitorError, RecvError,
    SamplerError, SourceError,
};
pub use events::{HealthRecord, HostInfo, Sample, Severity};
pub use monitor::HealthMonitor;
