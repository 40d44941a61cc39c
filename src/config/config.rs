use crate::analyzer::thresholds::{default_thresholds, Threshold};
use crate::error::ConfigError;
use crate::hub::overflow::MAX_WINDOW_SECS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest sampling interval accepted, one hour
pub const MAX_INTERVAL_MS: u64 = 3_600_000;

/// Longest feed client timeout accepted, one day
pub const MAX_CLIENT_TIMEOUT_SECS: u64 = 86_400;

/// Longest initial log retry delay accepted, one minute
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Top-level application configuration
///
/// Every section and field has a default, so an empty TOML document is a
/// valid configuration.
///
/// # Example
///
/// ```
/// use kernel_health::config::Config;
///
/// let config = Config::from_toml_str("[sampler]\ninterval_ms = 1000").unwrap();
/// assert_eq!(config.sampler.interval_ms, 1000);
/// assert_eq!(config.hub.history_capacity, 300);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sampler: SamplerConfig,
    pub analyzer: AnalyzerConfig,
    pub hub: HubConfig,
    pub feed: FeedConfig,
    pub auth: AuthConfig,
    pub log_sink: LogSinkConfig,
}

/// Sampling cadence and failure handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    /// Interval between samples in milliseconds
    pub interval_ms: u64,
    /// Consecutive read failures before degraded samples are emitted
    pub degraded_after_failures: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            degraded_after_failures: 2,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Smoothing, hysteresis and threshold settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Exponential moving average factor in (0, 1]; 1.0 disables smoothing
    pub smoothing_alpha: f64,
    /// Consecutive sub-threshold samples required before a downgrade
    pub downgrade_after: u32,
    /// Samples needed before a metric reports full confidence
    pub warmup_samples: u32,
    /// Per-metric overrides merged over the built-in thresholds
    pub thresholds: BTreeMap<String, Threshold>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            smoothing_alpha: 0.5,
            downgrade_after: 3,
            warmup_samples: 3,
            thresholds: BTreeMap::new(),
        }
    }
}

impl AnalyzerConfig {
    /// Built-in thresholds with the configured overrides applied
    ///
    /// An override without a reason keeps the built-in reason for that metric.
    pub fn threshold_table(&self) -> BTreeMap<String, Threshold> {
        let mut table = default_thresholds();
        for (name, threshold) in &self.thresholds {
            let mut threshold = threshold.clone();
            if threshold.reason.is_none() {
                threshold.reason = table.get(name).and_then(|t| t.reason.clone());
            }
            table.insert(name.clone(), threshold);
        }
        table
    }
}

/// History size and per-subscriber backpressure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Records kept in the history ring
    pub history_capacity: usize,
    /// Outbound queue length per subscriber
    pub queue_capacity: usize,
    /// Sliding window for counting queue overflows, in seconds
    pub overflow_window_secs: u64,
    /// Overflows tolerated inside the window before disconnecting
    pub max_overflows: usize,
    /// History records handed to a new subscriber with its snapshot
    pub snapshot_history: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_capacity: 300,
            queue_capacity: 16,
            overflow_window_secs: 30,
            max_overflows: 8,
            snapshot_history: 30,
        }
    }
}

/// WebSocket live feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    pub bind: String,
    /// Connections silent for longer than this are closed
    pub client_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8765".to_string(),
            client_timeout_secs: 60,
        }
    }
}

impl FeedConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind.parse().map_err(|e| {
            ConfigError::ParseError(format!("feed.bind '{}' is not a socket address: {}", self.bind, e))
        })
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Session tokens accepted by the static session gate
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Token to user id
    pub tokens: BTreeMap<String, String>,
}

/// Where alert log entries are appended
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSinkKind {
    #[default]
    None,
    File,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSinkConfig {
    pub kind: LogSinkKind,
    /// JSON-lines file for `kind = "file"`
    pub path: Option<PathBuf>,
    /// Endpoint receiving POSTed entries for `kind = "http"`
    pub endpoint: Option<String>,
    /// Entries buffered before new ones are dropped
    pub queue_capacity: usize,
    /// Append attempts per entry
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            kind: LogSinkKind::None,
            path: None,
            endpoint: None,
            queue_capacity: 64,
            max_attempts: 3,
            retry_delay_ms: 200,
            timeout_secs: 5,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, a TOML
    /// error if it cannot be parsed, and `ConfigError::ValidationError` if a
    /// value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value that would make the pipeline misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampler.interval_ms == 0 || self.sampler.interval_ms > MAX_INTERVAL_MS {
            return Err(ConfigError::ValidationError(format!(
                "sampler.interval_ms must be between 1 and {}, got {}",
                MAX_INTERVAL_MS, self.sampler.interval_ms
            )));
        }
        if self.sampler.degraded_after_failures == 0 {
            return Err(ConfigError::ValidationError(
                "sampler.degraded_after_failures must be at least 1".to_string(),
            ));
        }

        let alpha = self.analyzer.smoothing_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "analyzer.smoothing_alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        if self.analyzer.downgrade_after == 0 {
            return Err(ConfigError::ValidationError(
                "analyzer.downgrade_after must be at least 1".to_string(),
            ));
        }
        if self.analyzer.warmup_samples == 0 {
            return Err(ConfigError::ValidationError(
                "analyzer.warmup_samples must be at least 1".to_string(),
            ));
        }
        for (name, threshold) in &self.analyzer.thresholds {
            if !threshold.is_ordered() {
                return Err(ConfigError::ValidationError(format!(
                    "threshold '{}': critical ({}) must lie beyond warning ({}) in the {:?} direction",
                    name, threshold.critical, threshold.warning, threshold.direction
                )));
            }
        }

        if self.hub.history_capacity == 0 || self.hub.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "hub.history_capacity and hub.queue_capacity must be greater than zero"
                    .to_string(),
            ));
        }
        if self.hub.overflow_window_secs == 0 || self.hub.overflow_window_secs > MAX_WINDOW_SECS {
            return Err(ConfigError::ValidationError(format!(
                "hub.overflow_window_secs must be between 1 and {}, got {}",
                MAX_WINDOW_SECS, self.hub.overflow_window_secs
            )));
        }

        if self.feed.client_timeout_secs == 0
            || self.feed.client_timeout_secs > MAX_CLIENT_TIMEOUT_SECS
        {
            return Err(ConfigError::ValidationError(format!(
                "feed.client_timeout_secs must be between 1 and {}, got {}",
                MAX_CLIENT_TIMEOUT_SECS, self.feed.client_timeout_secs
            )));
        }

        if self.feed.enabled {
            self.feed.bind_addr()?;
        }

        match self.log_sink.kind {
            LogSinkKind::File if self.log_sink.path.is_none() => {
                return Err(ConfigError::ValidationError(
                    "log_sink.path is required for kind = \"file\"".to_string(),
                ));
            }
            LogSinkKind::Http if self.log_sink.endpoint.is_none() => {
                return Err(ConfigError::ValidationError(
                    "log_sink.endpoint is required for kind = \"http\"".to_string(),
                ));
            }
            _ => {}
        }
        if self.log_sink.retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(ConfigError::ValidationError(format!(
                "log_sink.retry_delay_ms must be at most {}, got {}",
                MAX_RETRY_DELAY_MS, self.log_sink.retry_delay_ms
            )));
        }
        if self.log_sink.queue_capacity == 0 || self.log_sink.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "log_sink.queue_capacity and log_sink.max_attempts must be greater than zero"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::thresholds::Direction;
    use crate::events::metric;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sampler.interval(), Duration::from_secs(2));
        assert_eq!(config.hub.history_capacity, 300);
        assert_eq!(config.analyzer.downgrade_after, 3);
        assert_eq!(config.log_sink.kind, LogSinkKind::None);
    }

    #[test]
    fn test_full_document() {
        let toml = r#"
            [sampler]
            interval_ms = 500
            degraded_after_failures = 4

            [analyzer]
            smoothing_alpha = 1.0
            downgrade_after = 5

            [analyzer.thresholds.cpu_usage]
            warning = 60.0
            critical = 90.0

            [analyzer.thresholds.cpu_freq_mhz]
            warning = 1200.0
            critical = 800.0
            direction = "below"
            reason = "CPU Throttling"

            [hub]
            history_capacity = 10
            queue_capacity = 4

            [feed]
            bind = "0.0.0.0:9000"

            [auth.tokens]
            secret-token = "alice"

            [log_sink]
            kind = "file"
            path = "/var/log/kernel-health.jsonl"
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.sampler.interval_ms, 500);
        assert_eq!(config.sampler.degraded_after_failures, 4);
        assert_eq!(config.analyzer.downgrade_after, 5);
        assert_eq!(config.hub.queue_capacity, 4);
        assert_eq!(config.hub.max_overflows, 8);
        assert_eq!(config.feed.bind_addr().unwrap().port(), 9000);
        assert_eq!(
            config.auth.tokens.get("secret-token").map(String::as_str),
            Some("alice")
        );
        assert_eq!(config.log_sink.kind, LogSinkKind::File);

        let table = config.analyzer.threshold_table();
        let cpu = &table[metric::CPU_USAGE];
        assert_eq!(cpu.warning, 60.0);
        assert_eq!(cpu.critical, 90.0);
        // Overrides without a reason keep the built-in label
        assert_eq!(cpu.reason.as_deref(), Some("CPU Overload"));

        let freq = &table[metric::CPU_FREQ_MHZ];
        assert_eq!(freq.direction, Direction::Below);
        assert_eq!(freq.reason.as_deref(), Some("CPU Throttling"));

        // Untouched defaults survive the merge
        assert!(table.contains_key(metric::CPU_TEMP));
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let result = Config::from_toml_str("[sampler]\ninterval_ms = 0");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_bounds_durations() {
        let rejected = [
            "[sampler]\ninterval_ms = 3600001",
            "[sampler]\ninterval_ms = 9223372036854775807",
            "[hub]\noverflow_window_secs = 86401",
            "[hub]\noverflow_window_secs = 100000000000000000",
            "[feed]\nclient_timeout_secs = 0",
            "[feed]\nclient_timeout_secs = 86401",
            "[log_sink]\nretry_delay_ms = 60001",
        ];
        for toml in rejected {
            assert!(
                matches!(
                    Config::from_toml_str(toml),
                    Err(ConfigError::ValidationError(_))
                ),
                "{:?} should be rejected",
                toml
            );
        }

        let accepted = "[sampler]\ninterval_ms = 3600000\n[hub]\noverflow_window_secs = 86400\n[feed]\nclient_timeout_secs = 1";
        assert!(Config::from_toml_str(accepted).is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_smoothing() {
        for alpha in ["0.0", "1.5", "-0.2"] {
            let toml = format!("[analyzer]\nsmoothing_alpha = {}", alpha);
            assert!(
                matches!(
                    Config::from_toml_str(&toml),
                    Err(ConfigError::ValidationError(_))
                ),
                "alpha {} should be rejected",
                alpha
            );
        }
    }

    #[test]
    fn test_validation_rejects_inverted_threshold() {
        let toml = "[analyzer.thresholds.cpu_usage]\nwarning = 90.0\ncritical = 60.0";
        assert!(matches!(
            Config::from_toml_str(toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_requires_sink_target() {
        assert!(matches!(
            Config::from_toml_str("[log_sink]\nkind = \"file\""),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[log_sink]\nkind = \"http\""),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_bind() {
        assert!(matches!(
            Config::from_toml_str("[feed]\nbind = \"not an address\""),
            Err(ConfigError::ParseError(_))
        ));
        // A disabled feed does not need a valid address
        assert!(Config::from_toml_str("[feed]\nenabled = false\nbind = \"nope\"").is_ok());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            Config::from_toml_str("[sampler\ninterval_ms = 1"),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[hub]\nhistory_capacity = 42").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.hub.history_capacity, 42);
    }

    #[test]
    fn test_from_missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/kernel-health.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
