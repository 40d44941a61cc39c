//! Append-only log sink contract and its concrete bindings
//!
//! Warning and critical health records are summarized into [`LogEntry`]s and
//! appended to a [`LogSink`]. The store behind the sink is external; this
//! module only knows how to hand entries over.

use crate::config::{LogSinkConfig, LogSinkKind};
use crate::error::LogSinkError;
use crate::events::{HealthRecord, Severity, Timestamp};
use log::{debug, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::Runtime;

/// One alert-level health record as written to the log store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: Timestamp,
    pub overall: Severity,
    pub per_metric_severities: BTreeMap<String, Severity>,
    pub reason: Option<String>,
}

impl LogEntry {
    /// Summarize a record, if it is severe enough to be logged
    ///
    /// # Returns
    ///
    /// `Some(entry)` for warning and critical records, `None` otherwise
    pub fn from_record(record: &HealthRecord) -> Option<Self> {
        if !record.overall.is_alert() {
            return None;
        }
        Some(Self {
            timestamp: record.timestamp,
            overall: record.overall,
            per_metric_severities: record.severities(),
            reason: record.reason.clone(),
        })
    }
}

/// Append-only destination for log entries
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send {
    /// Append one entry
    fn append(&mut self, entry: &LogEntry) -> Result<(), LogSinkError>;

    /// Short description for log messages
    fn describe(&self) -> String;
}

/// Sink writing one JSON object per line to a local file
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it and its parent directory if needed
    pub fn open(path: &Path) -> Result<Self, LogSinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Appending alert log entries to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl LogSink for JsonLinesSink {
    fn append(&mut self, entry: &LogEntry) -> Result<(), LogSinkError> {
        let line = serde_json::to_string(entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Sink POSTing each entry as JSON to a remote log store
pub struct HttpLogSink {
    client: Client,
    endpoint: String,
    runtime: Runtime,
}

impl HttpLogSink {
    /// Create a sink for `endpoint`
    ///
    /// # Arguments
    ///
    /// * `endpoint` - URL receiving one POST per entry
    /// * `timeout` - Per-request timeout
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, LogSinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        // The sink runs on a plain worker thread, so it owns a small runtime
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        info!("Posting alert log entries to {}", endpoint);
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            runtime,
        })
    }

    async fn post(client: &Client, endpoint: &str, entry: &LogEntry) -> Result<(), LogSinkError> {
        let response = client.post(endpoint).json(entry).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LogSinkError::Status(status.as_u16()));
        }
        debug!("Log entry accepted by {} ({})", endpoint, status);
        Ok(())
    }
}

impl LogSink for HttpLogSink {
    fn append(&mut self, entry: &LogEntry) -> Result<(), LogSinkError> {
        self.runtime
            .block_on(Self::post(&self.client, &self.endpoint, entry))
    }

    fn describe(&self) -> String {
        format!("http {}", self.endpoint)
    }
}

/// Build the sink selected by configuration
///
/// # Returns
///
/// `Ok(None)` when logging is disabled (`kind = "none"`)
pub fn build_sink(config: &LogSinkConfig) -> Result<Option<Box<dyn LogSink>>, LogSinkError> {
    match config.kind {
        LogSinkKind::None => Ok(None),
        LogSinkKind::File => {
            let path = config.path.as_deref().ok_or_else(|| {
                LogSinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "log_sink.path is not set",
                ))
            })?;
            Ok(Some(Box::new(JsonLinesSink::open(path)?)))
        }
        LogSinkKind::Http => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                LogSinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "log_sink.endpoint is not set",
                ))
            })?;
            let sink = HttpLogSink::new(endpoint, Duration::from_secs(config.timeout_secs))?;
            Ok(Some(Box::new(sink)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{metric, MetricHealth};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(overall: Severity) -> HealthRecord {
        let mut record = HealthRecord::initial(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        record.metrics.insert(
            metric::CPU_TEMP.to_string(),
            MetricHealth {
                value: 93.0,
                smoothed: 91.0,
                severity: overall,
                confidence: 1.0,
            },
        );
        record.overall = overall;
        if overall.is_alert() {
            record.reason = Some("CPU Overheating".to_string());
        }
        record
    }

    #[test]
    fn test_entry_only_for_alert_records() {
        assert!(LogEntry::from_record(&record(Severity::Normal)).is_none());

        let entry = LogEntry::from_record(&record(Severity::Critical)).unwrap();
        assert_eq!(entry.overall, Severity::Critical);
        assert_eq!(entry.reason.as_deref(), Some("CPU Overheating"));
        assert_eq!(
            entry.per_metric_severities.get(metric::CPU_TEMP),
            Some(&Severity::Critical)
        );
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = LogEntry::from_record(&record(Severity::Warning)).unwrap();
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["overall"], "warning");
        assert_eq!(json["per_metric_severities"]["cpu_temp"], "warning");
        assert_eq!(json["reason"], "CPU Overheating");
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("alerts.jsonl");

        let entry = LogEntry::from_record(&record(Severity::Critical)).unwrap();
        {
            let mut sink = JsonLinesSink::open(&path).unwrap();
            sink.append(&entry).unwrap();
            sink.append(&entry).unwrap();
        }
        // Reopening appends rather than truncating
        {
            let mut sink = JsonLinesSink::open(&path).unwrap();
            sink.append(&entry).unwrap();
            assert!(sink.describe().contains("alerts.jsonl"));
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: LogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_build_sink_from_config() {
        assert!(build_sink(&LogSinkConfig::default()).unwrap().is_none());

        let dir = TempDir::new().unwrap();
        let config = LogSinkConfig {
            kind: LogSinkKind::File,
            path: Some(dir.path().join("alerts.jsonl")),
            ..LogSinkConfig::default()
        };
        let sink = build_sink(&config).unwrap().unwrap();
        assert!(sink.describe().starts_with("file"));

        let config = LogSinkConfig {
            kind: LogSinkKind::Http,
            endpoint: Some("http://127.0.0.1:9/logs".to_string()),
            ..LogSinkConfig::default()
        };
        let sink = build_sink(&config).unwrap().unwrap();
        assert_eq!(sink.describe(), "http http://127.0.0.1:9/logs");
    }

    #[test]
    fn test_http_sink_reports_unreachable_store() {
        let mut sink = HttpLogSink::new("http://127.0.0.1:9/logs", Duration::from_secs(1)).unwrap();
        let entry = LogEntry::from_record(&record(Severity::Critical)).unwrap();
        assert!(matches!(sink.append(&entry), Err(LogSinkError::Http(_))));
    }
}
