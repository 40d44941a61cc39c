use crate::collectors::host_source::MetricSource;
use crate::config::SamplerConfig;
use crate::error::SamplerError;
use crate::events::Sample;
use crate::stats::PipelineStats;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest single sleep, so a stop request is noticed quickly
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shortest interval a schedule runs at
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Fixed-interval tick schedule with skip-not-queue semantics
///
/// Ticks fall on `origin + k * interval`. After a read, the schedule moves to
/// the first boundary that is not already in the past; boundaries passed
/// during an overrunning read are skipped. Deliveries are spaced at least one
/// interval apart.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    interval: Duration,
    next_tick: Instant,
    last_delivery: Option<Instant>,
}

impl TickSchedule {
    /// Create a schedule whose first tick is at `origin`
    ///
    /// Intervals shorter than one millisecond are raised to one millisecond.
    pub fn new(interval: Duration, origin: Instant) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            next_tick: origin,
            last_delivery: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// When the next read should start
    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// Move past the current tick once its read has finished at `now`
    ///
    /// # Returns
    ///
    /// Number of tick boundaries skipped because the read overran them
    pub fn advance(&mut self, now: Instant) -> u64 {
        let Some(next) = self.next_tick.checked_add(self.interval) else {
            // No later boundary is representable; restart the grid at now
            self.next_tick = now;
            return 0;
        };
        if next >= now {
            self.next_tick = next;
            return 0;
        }

        let behind = (now - next).as_nanos();
        let step = self.interval.as_nanos();
        let skipped = behind.div_ceil(step);
        let jump = u64::try_from(skipped * step)
            .ok()
            .map(Duration::from_nanos)
            .and_then(|jump| next.checked_add(jump));
        self.next_tick = jump.unwrap_or(now);
        u64::try_from(skipped).unwrap_or(u64::MAX)
    }

    /// Earliest instant a sample read at `now` may be delivered
    pub fn earliest_delivery(&self, now: Instant) -> Instant {
        match self
            .last_delivery
            .and_then(|previous| previous.checked_add(self.interval))
        {
            Some(earliest) => now.max(earliest),
            None => now,
        }
    }

    pub fn record_delivery(&mut self, at: Instant) {
        self.last_delivery = Some(at);
    }
}

/// Drives a [`MetricSource`] on a fixed interval
///
/// Runs the source on a dedicated thread and forwards every sample over a
/// channel. Repeated source failures turn into degraded samples so that
/// downstream consumers always see liveness.
pub struct Sampler {
    /// Sampling interval and failure tolerance
    config: SamplerConfig,
    /// Source, held here while the sampler is stopped
    source: Option<Box<dyn MetricSource>>,
    /// Channel to send samples downstream
    output_channel: Sender<Sample>,
    /// Handle to the background thread; returns the source when joined
    thread_handle: Option<JoinHandle<Box<dyn MetricSource>>>,
    /// Shared state for controlling the sampler
    running: Arc<Mutex<bool>>,
    stats: Arc<PipelineStats>,
}

fn is_running(running: &Mutex<bool>) -> bool {
    *running.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_running(running: &Mutex<bool>, value: bool) -> bool {
    let mut flag = running.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *flag, value)
}

/// Sleep until `deadline` in short slices
///
/// # Returns
///
/// `false` if the sampler was stopped while sleeping
fn sleep_until(deadline: Instant, running: &Mutex<bool>) -> bool {
    loop {
        if !is_running(running) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

impl Sampler {
    /// Create a new Sampler
    ///
    /// # Arguments
    ///
    /// * `config` - Interval and degraded-sample threshold
    /// * `source` - Where samples are read from
    /// * `channel` - Channel that receives every sample
    /// * `stats` - Shared pipeline counters
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::mpsc;
    /// use kernel_health::collectors::{HostMetricSource, Sampler};
    /// use kernel_health::config::SamplerConfig;
    /// use kernel_health::stats::PipelineStats;
    ///
    /// let (tx, rx) = mpsc::channel();
    /// let mut sampler = Sampler::new(
    ///     SamplerConfig::default(),
    ///     Box::new(HostMetricSource::new()),
    ///     tx,
    ///     PipelineStats::new(),
    /// );
    /// sampler.start().unwrap();
    /// let sample = rx.recv().unwrap();
    /// sampler.stop().unwrap();
    /// ```
    pub fn new(
        config: SamplerConfig,
        source: Box<dyn MetricSource>,
        channel: Sender<Sample>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            source: Some(source),
            output_channel: channel,
            thread_handle: None,
            running: Arc::new(Mutex::new(false)),
            stats,
        }
    }

    /// Start sampling on a background thread
    ///
    /// Calling `start` on a running sampler does nothing.
    pub fn start(&mut self) -> Result<(), SamplerError> {
        if set_running(&self.running, true) {
            info!("Sampler already running, skipping start");
            return Ok(());
        }

        // A thread that exited on its own (closed channel) still holds the source
        if let Some(handle) = self.thread_handle.take() {
            self.source = Some(handle.join().map_err(|_| SamplerError::ThreadPanicked)?);
        }

        let Some(source) = self.source.take() else {
            set_running(&self.running, false);
            return Err(SamplerError::ThreadPanicked);
        };

        let config = self.config.clone();
        let channel = self.output_channel.clone();
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);

        debug!("Spawning sampler thread");
        let spawned = thread::Builder::new()
            .name("sampler".to_string())
            .spawn(move || Self::sampler_thread(config, source, channel, running, stats));

        match spawned {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                info!(
                    "Sampler started with interval {:?}",
                    self.config.interval().max(MIN_INTERVAL)
                );
                Ok(())
            }
            Err(e) => {
                set_running(&self.running, false);
                error!("Failed to spawn sampler thread: {}", e);
                Err(SamplerError::SpawnFailed(e))
            }
        }
    }

    /// Stop sampling and join the thread
    pub fn stop(&mut self) -> Result<(), SamplerError> {
        if !set_running(&self.running, false) && self.thread_handle.is_none() {
            debug!("Sampler already stopped");
            return Ok(());
        }

        if let Some(handle) = self.thread_handle.take() {
            debug!("Waiting for sampler thread to join");
            let source = handle.join().map_err(|_| {
                error!("Failed to join sampler thread");
                SamplerError::ThreadPanicked
            })?;
            self.source = Some(source);
        }

        info!("Sampler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        is_running(&self.running)
    }

    fn sampler_thread(
        config: SamplerConfig,
        mut source: Box<dyn MetricSource>,
        channel: Sender<Sample>,
        running: Arc<Mutex<bool>>,
        stats: Arc<PipelineStats>,
    ) -> Box<dyn MetricSource> {
        let mut schedule = TickSchedule::new(config.interval(), Instant::now());
        let mut consecutive_failures: u32 = 0;

        info!("Sampler thread started");

        while sleep_until(schedule.next_tick(), &running) {
            let sample = match source.read() {
                Ok(sample) => {
                    if consecutive_failures > 0 {
                        info!(
                            "Metric source recovered after {} failure(s)",
                            consecutive_failures
                        );
                    }
                    consecutive_failures = 0;
                    Some(sample)
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    stats.record_source_failure();
                    if consecutive_failures >= config.degraded_after_failures {
                        warn!(
                            "Metric source failed {} time(s) in a row: {}, emitting degraded sample",
                            consecutive_failures, e
                        );
                        Some(Sample::degraded(Utc::now()))
                    } else {
                        warn!("Metric source read failed, skipping tick: {}", e);
                        None
                    }
                }
            };

            if let Some(sample) = sample {
                let deliver_at = schedule.earliest_delivery(Instant::now());
                if !sleep_until(deliver_at, &running) {
                    break;
                }
                stats.record_sample(sample.degraded);
                if channel.send(sample).is_err() {
                    info!("Sample receiver closed, sampler exiting");
                    break;
                }
                schedule.record_delivery(Instant::now());
            }

            stats.record_skipped_ticks(schedule.advance(Instant::now()));
        }

        set_running(&running, false);
        info!("Sampler thread exiting");
        source
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if self.is_running() || self.thread_handle.is_some() {
            if let Err(e) = self.stop() {
                error!("Failed to stop sampler on drop: {}", e);
            }
        }
    }
}
