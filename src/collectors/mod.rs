/// Host metric source adapter
pub mod host_source;

/// Fixed-interval sampler driving a metric source
pub mod sampler;

pub use host_source::{parse_proc_stat, HostMetricSource, KernelCounters, MetricSource};
pub use sampler::{Sampler, TickSchedule};
