/// Log sink contract, entries and concrete sinks
pub mod log_sink;

/// Bounded, retrying delivery to a log sink
pub mod dispatcher;

pub use dispatcher::LogDispatcher;
pub use log_sink::{build_sink, HttpLogSink, JsonLinesSink, LogEntry, LogSink};
