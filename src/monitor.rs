//! Health monitor
//!
//! Owns and wires the pipeline: sampler thread → analyzer (pipeline thread) →
//! hub → log dispatcher. Start and stop are deterministic: `stop` joins every
//! thread it started and closes every subscriber.

use crate::alerts::{LogDispatcher, LogEntry, LogSink};
use crate::analyzer::HealthAnalyzer;
use crate::collectors::{MetricSource, Sampler};
use crate::config::Config;
use crate::error::{HubError, MonitorError};
use crate::events::{HealthRecord, HostInfo, Sample, Severity, Timestamp};
use crate::gate::SessionGate;
use crate::hub::Hub;
use crate::stats::{PipelineStats, PipelineTimer};
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the pipeline thread checks for a stop request while idle
const PIPELINE_POLL: Duration = Duration::from_millis(100);

/// Everything the pipeline thread owns
struct Pipeline {
    analyzer: HealthAnalyzer,
    hub: Arc<Hub>,
    dispatcher: Option<LogDispatcher>,
    stats: Arc<PipelineStats>,
    last_overall: Option<Severity>,
    /// Newest timestamp handed to the hub
    last_timestamp: Timestamp,
    /// Set while the wall clock is behind `last_timestamp`
    clock_behind: bool,
}

impl Pipeline {
    /// Keep timestamps non-decreasing when the wall clock steps backwards
    fn restamp(&mut self, sample: &mut Sample) {
        if sample.timestamp < self.last_timestamp {
            if !self.clock_behind {
                warn!(
                    "Clock stepped back from {} to {}, holding record timestamps until it catches up",
                    self.last_timestamp, sample.timestamp
                );
                self.clock_behind = true;
            }
            self.stats.record_restamped_sample();
            sample.timestamp = self.last_timestamp;
        } else {
            if self.clock_behind {
                info!("Clock caught up at {}", sample.timestamp);
                self.clock_behind = false;
            }
            self.last_timestamp = sample.timestamp;
        }
    }

    fn process(&mut self, mut sample: Sample) -> Result<(), HubError> {
        let timer = PipelineTimer::start(Arc::clone(&self.stats));
        self.restamp(&mut sample);
        let record = self.analyzer.classify(&sample);
        self.report_transition(&record);

        let entry = LogEntry::from_record(&record);
        match self.hub.publish(record) {
            Ok(report) => {
                if !report.disconnected.is_empty() {
                    warn!(
                        "{} subscriber(s) disconnected as overwhelmed",
                        report.disconnected.len()
                    );
                }
                if let (Some(dispatcher), Some(entry)) = (self.dispatcher.as_ref(), entry) {
                    // Failures are counted and logged by the dispatcher
                    let _ = dispatcher.submit_entry(entry);
                }
            }
            Err(HubError::StaleRecord { record, current }) => {
                warn!(
                    "Dropping out-of-order record at {} (current is {})",
                    record, current
                );
            }
            Err(e) => return Err(e),
        }

        timer.finish();
        Ok(())
    }

    fn report_transition(&mut self, record: &HealthRecord) {
        if self.last_overall == Some(record.overall) {
            return;
        }
        match record.overall {
            Severity::Normal => info!("Host health is normal"),
            Severity::Warning | Severity::Critical => warn!(
                "Host health is {:?}: {}",
                record.overall,
                record.reason.as_deref().unwrap_or("unknown cause")
            ),
        }
        self.last_overall = Some(record.overall);
    }
}

/// Owns the sampler, the analyzer thread, the hub and the log dispatcher
pub struct HealthMonitor {
    config: Config,
    hub: Arc<Hub>,
    stats: Arc<PipelineStats>,
    host_info: HostInfo,
    sampler: Sampler,
    /// Parts handed to the pipeline thread on start
    pending: Option<(Receiver<Sample>, Option<Box<dyn LogSink>>)>,
    pipeline_handle: Option<JoinHandle<()>>,
    running: Arc<Mutex<bool>>,
    stopped: bool,
}

impl HealthMonitor {
    /// Assemble a monitor
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `source` - Metric source driven by the sampler
    /// * `gate` - Session gate consulted by the hub
    /// * `log_sink` - Destination for alert log entries, if any
    pub fn new(
        config: Config,
        source: Box<dyn MetricSource>,
        gate: Arc<dyn SessionGate>,
        log_sink: Option<Box<dyn LogSink>>,
    ) -> Self {
        let stats = PipelineStats::new();
        let host_info = source.host_info();
        info!(
            "Monitoring {} ({}, kernel {}, {} cores)",
            host_info.host_name, host_info.os, host_info.kernel_version, host_info.core_count
        );

        let hub = Hub::new(config.hub.clone(), gate, Arc::clone(&stats));
        let (sample_sender, sample_receiver) = mpsc::channel();
        let sampler = Sampler::new(
            config.sampler.clone(),
            source,
            sample_sender,
            Arc::clone(&stats),
        );

        Self {
            config,
            hub,
            stats,
            host_info,
            sampler,
            pending: Some((sample_receiver, log_sink)),
            pipeline_handle: None,
            running: Arc::new(Mutex::new(false)),
            stopped: false,
        }
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn host_info(&self) -> &HostInfo {
        &self.host_info
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the pipeline thread, then the sampler
    ///
    /// Calling `start` on a running monitor does nothing.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::Stopped` after `stop`, or the error of whichever
    /// component failed to start.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.stopped {
            return Err(MonitorError::Stopped);
        }
        if self.is_running() {
            info!("HealthMonitor already running, skipping start");
            return Ok(());
        }
        let Some((receiver, log_sink)) = self.pending.take() else {
            return Err(MonitorError::Stopped);
        };

        let dispatcher = match log_sink {
            Some(sink) => Some(LogDispatcher::start(
                sink,
                &self.config.log_sink,
                Arc::clone(&self.stats),
            )?),
            None => None,
        };

        let pipeline = Pipeline {
            analyzer: HealthAnalyzer::new(&self.config.analyzer),
            hub: Arc::clone(&self.hub),
            dispatcher,
            stats: Arc::clone(&self.stats),
            last_overall: None,
            last_timestamp: self.hub.current().timestamp,
            clock_behind: false,
        };

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = true;
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || Self::pipeline_thread(pipeline, receiver, running));
        match handle {
            Ok(handle) => self.pipeline_handle = Some(handle),
            Err(e) => {
                *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
                return Err(MonitorError::Spawn(e));
            }
        }

        if let Err(e) = self.sampler.start() {
            error!("Failed to start sampler: {}", e);
            self.stop();
            return Err(e.into());
        }

        info!("HealthMonitor started");
        Ok(())
    }

    /// Stop every component and join their threads
    ///
    /// Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Stopping HealthMonitor");

        if let Err(e) = self.sampler.stop() {
            error!("Failed to stop sampler: {}", e);
        }

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = false;
        if let Some(handle) = self.pipeline_handle.take() {
            if handle.join().is_err() {
                error!("Pipeline thread panicked");
            }
        }

        self.hub.shutdown();
        self.stats.log_summary();
        info!("HealthMonitor stopped");
    }

    fn pipeline_thread(mut pipeline: Pipeline, receiver: Receiver<Sample>, running: Arc<Mutex<bool>>) {
        info!("Pipeline thread started");
        loop {
            match receiver.recv_timeout(PIPELINE_POLL) {
                Ok(sample) => {
                    if let Err(e) = pipeline.process(sample) {
                        warn!("Hub refused record: {}, pipeline exiting", e);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !*running.lock().unwrap_or_else(PoisonError::into_inner) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Sample channel closed");
                    break;
                }
            }
        }

        // Samples already delivered before the stop still get published
        while let Ok(sample) = receiver.try_recv() {
            if pipeline.process(sample).is_err() {
                break;
            }
        }

        if let Some(mut dispatcher) = pipeline.dispatcher.take() {
            dispatcher.shutdown();
        }
        info!("Pipeline thread exiting");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
