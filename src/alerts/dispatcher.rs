use crate::alerts::log_sink::{LogEntry, LogSink};
use crate::config::LogSinkConfig;
use crate::error::LogSinkError;
use crate::events::HealthRecord;
use crate::stats::PipelineStats;
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Upper bound for the delay between two append attempts
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Best-effort delivery of log entries to a [`LogSink`]
///
/// Entries are buffered in a bounded queue and appended by a worker thread,
/// so a slow or failing sink never holds up the pipeline. When the queue is
/// full the new entry is dropped with a warning. Each entry gets a bounded
/// number of append attempts with exponential backoff; an entry that still
/// fails is logged and discarded.
pub struct LogDispatcher {
    /// Producer side of the bounded queue
    sender: Option<SyncSender<LogEntry>>,
    /// Handle to the worker thread
    thread_handle: Option<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl LogDispatcher {
    /// Start a dispatcher in front of `sink`
    ///
    /// # Arguments
    ///
    /// * `sink` - Destination for entries; owned by the worker thread
    /// * `config` - Queue capacity, attempts and retry delay
    /// * `stats` - Shared pipeline counters
    pub fn start(
        sink: Box<dyn LogSink>,
        config: &LogSinkConfig,
        stats: Arc<PipelineStats>,
    ) -> Result<Self, LogSinkError> {
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let max_attempts = config.max_attempts.max(1);
        let retry_delay = Duration::from_millis(config.retry_delay_ms);
        let worker_stats = Arc::clone(&stats);

        info!(
            "Starting log dispatcher for {} (queue={}, attempts={})",
            sink.describe(),
            config.queue_capacity,
            max_attempts
        );
        let handle = thread::Builder::new()
            .name("log-dispatcher".to_string())
            .spawn(move || {
                Self::worker_thread(sink, receiver, max_attempts, retry_delay, worker_stats)
            })?;

        Ok(Self {
            sender: Some(sender),
            thread_handle: Some(handle),
            stats,
        })
    }

    /// Queue a log entry for a record if it is warning or critical
    ///
    /// # Returns
    ///
    /// `true` if an entry was queued
    pub fn submit(&self, record: &HealthRecord) -> bool {
        match LogEntry::from_record(record) {
            Some(entry) => self.submit_entry(entry).is_ok(),
            None => false,
        }
    }

    /// Queue an entry without blocking
    ///
    /// # Errors
    ///
    /// Returns `LogSinkError::QueueFull` if the queue is full or the
    /// dispatcher has shut down; the entry is dropped in both cases.
    pub fn submit_entry(&self, entry: LogEntry) -> Result<(), LogSinkError> {
        let Some(sender) = self.sender.as_ref() else {
            self.stats.record_log_dropped();
            return Err(LogSinkError::QueueFull);
        };

        match sender.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(entry)) => {
                warn!(
                    "Log queue full, dropping entry for {} ({:?})",
                    entry.timestamp, entry.overall
                );
                self.stats.record_log_dropped();
                Err(LogSinkError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("Log dispatcher worker is gone, dropping entry");
                self.stats.record_log_dropped();
                Err(LogSinkError::QueueFull)
            }
        }
    }

    /// Drain queued entries and stop the worker
    pub fn shutdown(&mut self) {
        // Closing the channel lets the worker finish what is queued and exit
        self.sender.take();
        if let Some(handle) = self.thread_handle.take() {
            debug!("Waiting for log dispatcher to drain");
            if handle.join().is_err() {
                error!("Log dispatcher thread panicked");
            }
            info!("Log dispatcher stopped");
        }
    }

    fn worker_thread(
        mut sink: Box<dyn LogSink>,
        receiver: Receiver<LogEntry>,
        max_attempts: u32,
        retry_delay: Duration,
        stats: Arc<PipelineStats>,
    ) {
        for entry in receiver {
            match Self::append_with_retry(sink.as_mut(), &entry, max_attempts, retry_delay) {
                Ok(()) => stats.record_log_written(),
                Err(e) => {
                    error!(
                        "Giving up on log entry for {} after {} attempt(s): {}",
                        entry.timestamp, max_attempts, e
                    );
                    stats.record_log_failed();
                }
            }
        }
        debug!("Log dispatcher worker exiting");
    }

    fn append_with_retry(
        sink: &mut dyn LogSink,
        entry: &LogEntry,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Result<(), LogSinkError> {
        let mut delay = retry_delay;
        let mut attempt = 1;
        loop {
            match sink.append(entry) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "Log append failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2).min(MAX_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }
}

impl Drop for LogDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::log_sink::MockLogSink;
    use crate::events::Severity;
    use chrono::Utc;
    use std::sync::Mutex;

    fn config(queue_capacity: usize, max_attempts: u32) -> LogSinkConfig {
        LogSinkConfig {
            queue_capacity,
            max_attempts,
            retry_delay_ms: 1,
            ..LogSinkConfig::default()
        }
    }

    fn record(overall: Severity) -> HealthRecord {
        let mut record = HealthRecord::initial(Utc::now());
        record.overall = overall;
        record.reason = overall.is_alert().then(|| "Kernel Stall".to_string());
        record
    }

    /// Sink that records every entry it accepts
    fn recording_sink() -> (MockLogSink, Arc<Mutex<Vec<LogEntry>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut sink = MockLogSink::new();
        let store = Arc::clone(&written);
        sink.expect_append().returning(move |entry| {
            store.lock().unwrap().push(entry.clone());
            Ok(())
        });
        sink.expect_describe().return_const("mock".to_string());
        (sink, written)
    }

    #[test]
    fn test_only_alert_records_are_logged() {
        let (sink, written) = recording_sink();
        let stats = PipelineStats::new();
        let mut dispatcher =
            LogDispatcher::start(Box::new(sink), &config(8, 3), Arc::clone(&stats)).unwrap();

        assert!(!dispatcher.submit(&record(Severity::Normal)));
        assert!(dispatcher.submit(&record(Severity::Warning)));
        assert!(dispatcher.submit(&record(Severity::Critical)));
        dispatcher.shutdown();

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].overall, Severity::Warning);
        assert_eq!(written[1].reason.as_deref(), Some("Kernel Stall"));
        assert_eq!(stats.snapshot().log_entries_written, 2);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let attempts = Arc::new(Mutex::new(0u32));
        let mut sink = MockLogSink::new();
        {
            let attempts = Arc::clone(&attempts);
            sink.expect_append().returning(move |_| {
                let mut count = attempts.lock().unwrap();
                *count += 1;
                if *count < 3 {
                    Err(LogSinkError::Status(503))
                } else {
                    Ok(())
                }
            });
        }
        sink.expect_describe().return_const("flaky".to_string());

        let stats = PipelineStats::new();
        let mut dispatcher =
            LogDispatcher::start(Box::new(sink), &config(8, 3), Arc::clone(&stats)).unwrap();
        dispatcher.submit(&record(Severity::Critical));
        dispatcher.shutdown();

        assert_eq!(*attempts.lock().unwrap(), 3);
        assert_eq!(stats.snapshot().log_entries_written, 1);
        assert_eq!(stats.snapshot().log_entries_failed, 0);
    }

    #[test]
    fn test_persistent_failure_is_swallowed() {
        let mut sink = MockLogSink::new();
        sink.expect_append()
            .times(4)
            .returning(|_| Err(LogSinkError::Status(500)));
        sink.expect_describe().return_const("broken".to_string());

        let stats = PipelineStats::new();
        let mut dispatcher =
            LogDispatcher::start(Box::new(sink), &config(8, 2), Arc::clone(&stats)).unwrap();
        dispatcher.submit(&record(Severity::Critical));
        dispatcher.submit(&record(Severity::Warning));
        dispatcher.shutdown();

        assert_eq!(stats.snapshot().log_entries_failed, 2);
        assert_eq!(stats.snapshot().log_entries_written, 0);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();

        let mut sink = MockLogSink::new();
        {
            let gate = Arc::clone(&gate);
            sink.expect_append().returning(move |_| {
                // Blocks until the test releases the gate
                let _open = gate.lock().unwrap();
                Ok(())
            });
        }
        sink.expect_describe().return_const("slow".to_string());

        let stats = PipelineStats::new();
        let mut dispatcher =
            LogDispatcher::start(Box::new(sink), &config(1, 1), Arc::clone(&stats)).unwrap();

        let mut accepted = 0;
        for _ in 0..10 {
            if dispatcher.submit(&record(Severity::Critical)) {
                accepted += 1;
            }
        }
        // At most one entry in the worker plus one in the queue
        assert!(accepted <= 2);
        assert!(stats.snapshot().log_entries_dropped >= 8);

        drop(held);
        dispatcher.shutdown();
        assert_eq!(stats.snapshot().log_entries_written, accepted);
    }

    #[test]
    fn test_submit_after_shutdown_is_dropped() {
        let (sink, _written) = recording_sink();
        let mut dispatcher =
            LogDispatcher::start(Box::new(sink), &config(8, 1), PipelineStats::new()).unwrap();
        dispatcher.shutdown();
        assert!(!dispatcher.submit(&record(Severity::Critical)));
    }
}
