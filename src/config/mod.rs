/// Configuration loading and validation
#[allow(clippy::module_inception)]
pub mod config;

pub use config::{
    AnalyzerConfig, AuthConfig, Config, FeedConfig, HubConfig, LogSinkConfig, LogSinkKind,
    SamplerConfig,
};
