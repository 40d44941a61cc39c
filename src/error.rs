use crate::hub::CloseReason;
use thiserror::Error;

/// Errors that can occur while reading host metrics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// A single counter could not be read; the metric is omitted from the sample
    #[error("Metric '{metric}' unavailable: {reason}")]
    Unavailable { metric: String, reason: String },

    /// Nothing at all could be read from the host
    #[error("Metric source degraded: {0}")]
    Degraded(String),
}

impl SourceError {
    pub fn unavailable(metric: impl Into<String>, reason: impl ToString) -> Self {
        SourceError::Unavailable {
            metric: metric.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors that can occur while starting or stopping the sampler
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Failed to spawn sampler thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Sampler thread panicked")]
    ThreadPanicked,
}

/// Errors returned by the broadcast hub
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HubError {
    #[error("Subscription rejected: {0}")]
    Unauthorized(String),

    #[error("Hub is shutting down")]
    ShuttingDown,

    #[error("Record at {record} is older than current record at {current}")]
    StaleRecord { record: String, current: String },
}

/// Errors observed by a subscriber while receiving updates
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    #[error("Subscription closed: {0}")]
    Closed(CloseReason),
}

/// Errors that can occur while validating a session credential
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Session gate unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur when appending to the log sink
#[derive(Error, Debug)]
pub enum LogSinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote log store answered with status {0}")]
    Status(u16),

    #[error("Failed to serialize log entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Log queue full")]
    QueueFull,
}

/// Errors that can occur while starting the health monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),

    #[error("Log sink error: {0}")]
    LogSink(#[from] LogSinkError),

    #[error("Failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Monitor has been stopped and cannot be restarted")]
    Stopped,
}

/// Errors raised by the live feed server
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
