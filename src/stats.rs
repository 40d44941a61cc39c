//! Self-monitoring counters for the health pipeline
//!
//! This module tracks how the monitor itself is doing: samples taken, ticks
//! skipped, records published, subscribers admitted or dropped, and log entries
//! written. Counters are lock-free atomics so every component can update them
//! from its own thread.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Classification latencies kept for the moving average
const MAX_LATENCY_SAMPLES: usize = 100;

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub samples: u64,
    pub degraded_samples: u64,
    pub skipped_ticks: u64,
    pub source_failures: u64,
    pub records_published: u64,
    pub stale_records: u64,
    /// Samples whose timestamp was held because the wall clock stepped back
    pub restamped_samples: u64,
    pub updates_delivered: u64,
    pub updates_dropped: u64,
    pub subscribers_admitted: u64,
    pub subscribers_rejected: u64,
    pub subscribers_overwhelmed: u64,
    pub log_entries_written: u64,
    pub log_entries_dropped: u64,
    pub log_entries_failed: u64,
    /// Average time from sample to publish, in milliseconds
    pub avg_pipeline_latency_ms: f64,
    /// Resident memory of this process in bytes, 0 if unknown
    pub memory_usage_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Shared pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    samples: AtomicU64,
    degraded_samples: AtomicU64,
    skipped_ticks: AtomicU64,
    source_failures: AtomicU64,
    records_published: AtomicU64,
    stale_records: AtomicU64,
    restamped_samples: AtomicU64,
    updates_delivered: AtomicU64,
    updates_dropped: AtomicU64,
    subscribers_admitted: AtomicU64,
    subscribers_rejected: AtomicU64,
    subscribers_overwhelmed: AtomicU64,
    log_entries_written: AtomicU64,
    log_entries_dropped: AtomicU64,
    log_entries_failed: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sample(&self, degraded: bool) {
        bump(&self.samples, 1);
        if degraded {
            bump(&self.degraded_samples, 1);
        }
    }

    pub fn record_skipped_ticks(&self, count: u64) {
        if count > 0 {
            debug!("Sampler skipped {} tick(s)", count);
            bump(&self.skipped_ticks, count);
        }
    }

    pub fn record_source_failure(&self) {
        bump(&self.source_failures, 1);
    }

    /// Record one publish and what it did to the subscriber set
    pub fn record_publish(&self, delivered: u64, dropped: u64, overwhelmed: u64) {
        bump(&self.records_published, 1);
        bump(&self.updates_delivered, delivered);
        bump(&self.updates_dropped, dropped);
        bump(&self.subscribers_overwhelmed, overwhelmed);
    }

    pub fn record_stale_record(&self) {
        bump(&self.stale_records, 1);
    }

    pub fn record_restamped_sample(&self) {
        bump(&self.restamped_samples, 1);
    }

    pub fn record_subscribe(&self, admitted: bool) {
        if admitted {
            bump(&self.subscribers_admitted, 1);
        } else {
            bump(&self.subscribers_rejected, 1);
        }
    }

    pub fn record_log_written(&self) {
        bump(&self.log_entries_written, 1);
    }

    pub fn record_log_dropped(&self) {
        bump(&self.log_entries_dropped, 1);
    }

    pub fn record_log_failed(&self) {
        bump(&self.log_entries_failed, 1);
    }

    /// Record how long one sample took to reach the hub
    pub fn record_pipeline_latency(&self, duration: Duration) {
        let mut latencies = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        latencies.push_back(duration);
        while latencies.len() > MAX_LATENCY_SAMPLES {
            latencies.pop_front();
        }
    }

    fn avg_latency_ms(&self) -> f64 {
        let latencies = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if latencies.is_empty() {
            return 0.0;
        }
        let total_ms: f64 = latencies.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        total_ms / latencies.len() as f64
    }

    /// Copy every counter into a serializable snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            samples: load(&self.samples),
            degraded_samples: load(&self.degraded_samples),
            skipped_ticks: load(&self.skipped_ticks),
            source_failures: load(&self.source_failures),
            records_published: load(&self.records_published),
            stale_records: load(&self.stale_records),
            restamped_samples: load(&self.restamped_samples),
            updates_delivered: load(&self.updates_delivered),
            updates_dropped: load(&self.updates_dropped),
            subscribers_admitted: load(&self.subscribers_admitted),
            subscribers_rejected: load(&self.subscribers_rejected),
            subscribers_overwhelmed: load(&self.subscribers_overwhelmed),
            log_entries_written: load(&self.log_entries_written),
            log_entries_dropped: load(&self.log_entries_dropped),
            log_entries_failed: load(&self.log_entries_failed),
            avg_pipeline_latency_ms: self.avg_latency_ms(),
            memory_usage_bytes: process_memory_bytes(),
            timestamp: Utc::now(),
        }
    }

    /// Log a summary line and warn about anything that looks unhealthy
    pub fn log_summary(&self) -> StatsSnapshot {
        let snapshot = self.snapshot();

        info!(
            "Pipeline stats: samples={} (degraded={}, skipped ticks={}), published={}, delivered={}, dropped={}, subscribers admitted={} rejected={} overwhelmed={}, log written={} dropped={} failed={}, latency={:.2}ms, memory={}MB",
            snapshot.samples,
            snapshot.degraded_samples,
            snapshot.skipped_ticks,
            snapshot.records_published,
            snapshot.updates_delivered,
            snapshot.updates_dropped,
            snapshot.subscribers_admitted,
            snapshot.subscribers_rejected,
            snapshot.subscribers_overwhelmed,
            snapshot.log_entries_written,
            snapshot.log_entries_dropped,
            snapshot.log_entries_failed,
            snapshot.avg_pipeline_latency_ms,
            snapshot.memory_usage_bytes / 1024 / 1024
        );

        if snapshot.samples > 0 && snapshot.degraded_samples * 2 > snapshot.samples {
            warn!(
                "Metric source degraded for {} of {} samples",
                snapshot.degraded_samples, snapshot.samples
            );
        }

        if snapshot.restamped_samples > 0 {
            warn!(
                "{} sample(s) were re-stamped after the clock stepped back",
                snapshot.restamped_samples
            );
        }

        if snapshot.log_entries_failed > 0 {
            warn!(
                "{} log entries could not be written",
                snapshot.log_entries_failed
            );
        }

        snapshot
    }
}

/// Measures the time from a sample's arrival to its publish
pub struct PipelineTimer {
    start_time: Instant,
    stats: Arc<PipelineStats>,
}

impl PipelineTimer {
    pub fn start(stats: Arc<PipelineStats>) -> Self {
        Self {
            start_time: Instant::now(),
            stats,
        }
    }

    pub fn finish(self) {
        self.stats
            .record_pipeline_latency(self.start_time.elapsed());
    }
}

/// Resident memory of the current process
fn process_memory_bytes() -> u64 {
    use sysinfo::System;

    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return 0;
    }
    system.process(pid).map(|process| process.memory()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_stats_are_zero() {
        let stats = PipelineStats::new();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.samples, 0);
        assert_eq!(snapshot.records_published, 0);
        assert_eq!(snapshot.avg_pipeline_latency_ms, 0.0);
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = PipelineStats::new();
        stats.record_sample(false);
        stats.record_sample(true);
        stats.record_skipped_ticks(3);
        stats.record_publish(4, 1, 1);
        stats.record_subscribe(true);
        stats.record_subscribe(false);
        stats.record_log_written();
        stats.record_log_dropped();
        stats.record_restamped_sample();

        let snapshot = stats.log_summary();
        assert_eq!(snapshot.samples, 2);
        assert_eq!(snapshot.degraded_samples, 1);
        assert_eq!(snapshot.skipped_ticks, 3);
        assert_eq!(snapshot.records_published, 1);
        assert_eq!(snapshot.updates_delivered, 4);
        assert_eq!(snapshot.updates_dropped, 1);
        assert_eq!(snapshot.subscribers_overwhelmed, 1);
        assert_eq!(snapshot.subscribers_admitted, 1);
        assert_eq!(snapshot.subscribers_rejected, 1);
        assert_eq!(snapshot.log_entries_written, 1);
        assert_eq!(snapshot.log_entries_dropped, 1);
        assert_eq!(snapshot.restamped_samples, 1);
    }

    #[test]
    fn test_latency_average_and_limit() {
        let stats = PipelineStats::new();
        for _ in 0..(MAX_LATENCY_SAMPLES + 20) {
            stats.record_pipeline_latency(Duration::from_millis(10));
        }
        let latencies = stats.latencies.lock().unwrap();
        assert_eq!(latencies.len(), MAX_LATENCY_SAMPLES);
        drop(latencies);
        assert!((stats.snapshot().avg_pipeline_latency_ms - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_pipeline_timer_records() {
        let stats = PipelineStats::new();
        let timer = PipelineTimer::start(Arc::clone(&stats));
        std::thread::sleep(Duration::from_millis(5));
        timer.finish();
        assert!(stats.snapshot().avg_pipeline_latency_ms >= 5.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = PipelineStats::new();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["samples"], 0);
    }
}
