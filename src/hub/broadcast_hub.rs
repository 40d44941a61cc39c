//! Broadcast hub with store-and-forward delivery
//!
//! The hub holds the one current [`HealthRecord`], a bounded history and the
//! set of live subscribers. A single writer publishes; any number of
//! subscribers read through their own bounded queues.

use crate::config::HubConfig;
use crate::error::{GateError, HubError};
use crate::events::HealthRecord;
use crate::gate::SessionGate;
use crate::hub::history::HistoryRing;
use crate::hub::overflow::OverflowWindow;
use crate::hub::subscriber::{
    CloseReason, PushOutcome, SubscriberId, SubscriberQueue, SubscriberState, Subscription,
};
use crate::stats::PipelineStats;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What a single publish did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the record
    pub delivered: usize,
    /// Queued updates lost to full subscriber queues
    pub dropped: usize,
    /// Subscribers disconnected as overwhelmed during this publish
    pub disconnected: Vec<SubscriberId>,
}

#[derive(Debug)]
struct HubState {
    current: Arc<HealthRecord>,
    history: HistoryRing,
    subscribers: HashMap<SubscriberId, Arc<SubscriberQueue>>,
    next_id: SubscriberId,
    shutting_down: bool,
}

/// Fan-out point between the analyzer and every viewer
pub struct Hub {
    config: HubConfig,
    gate: Arc<dyn SessionGate>,
    stats: Arc<PipelineStats>,
    state: Mutex<HubState>,
    // Serializes publishes so pushes to subscriber queues stay ordered
    publish_lock: Mutex<()>,
}

impl Hub {
    /// Create a new hub
    ///
    /// # Arguments
    ///
    /// * `config` - History and per-subscriber queue limits
    /// * `gate` - Consulted before admitting each subscriber
    /// * `stats` - Shared pipeline counters
    pub fn new(config: HubConfig, gate: Arc<dyn SessionGate>, stats: Arc<PipelineStats>) -> Arc<Self> {
        info!(
            "Hub created (history={}, queue={}, max_overflows={} per {}s)",
            config.history_capacity,
            config.queue_capacity,
            config.max_overflows,
            config.overflow_window_secs
        );
        let history = HistoryRing::new(config.history_capacity);
        Arc::new(Self {
            config,
            gate,
            stats,
            state: Mutex::new(HubState {
                current: Arc::new(HealthRecord::initial(Utc::now())),
                history,
                subscribers: HashMap::new(),
                next_id: 1,
                shutting_down: false,
            }),
            publish_lock: Mutex::new(()),
        })
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the current record and push it to every live subscriber
    ///
    /// A record older than the current one is rejected so that subscribers
    /// always observe non-decreasing timestamps.
    ///
    /// # Returns
    ///
    /// * `Ok(PublishReport)` - what the publish delivered and dropped
    /// * `Err(HubError::StaleRecord)` - the record predates the current one
    /// * `Err(HubError::ShuttingDown)` - the hub no longer accepts records
    pub fn publish(&self, record: HealthRecord) -> Result<PublishReport, HubError> {
        let _publishing = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = Arc::new(record);

        let targets: Vec<Arc<SubscriberQueue>> = {
            let mut state = self.state();
            if state.shutting_down {
                return Err(HubError::ShuttingDown);
            }
            if record.timestamp < state.current.timestamp {
                self.stats.record_stale_record();
                return Err(HubError::StaleRecord {
                    record: record.timestamp.to_rfc3339(),
                    current: state.current.timestamp.to_rfc3339(),
                });
            }
            state.current = Arc::clone(&record);
            state.history.push(Arc::clone(&record));
            state.subscribers.values().cloned().collect()
        };

        // Pushes happen outside the state lock; none of them block
        let mut report = PublishReport::default();
        for queue in &targets {
            match queue.push(Arc::clone(&record)) {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                }
                PushOutcome::Overwhelmed => {
                    report.dropped += 1;
                    report.disconnected.push(queue.id());
                }
                PushOutcome::Closed => {}
            }
        }

        if !report.disconnected.is_empty() {
            let mut state = self.state();
            for id in &report.disconnected {
                state.subscribers.remove(id);
                warn!("Subscriber {} overwhelmed, disconnected", id);
            }
        }

        self.stats.record_publish(
            report.delivered as u64,
            report.dropped as u64,
            report.disconnected.len() as u64,
        );
        debug!(
            "Published record at {} ({:?}) to {} subscriber(s)",
            record.timestamp, record.overall, report.delivered
        );
        Ok(report)
    }

    /// Admit a subscriber holding `credential`
    ///
    /// The current record is queued immediately and up to `snapshot_history`
    /// older records travel with the handle as its backlog.
    pub fn subscribe(self: &Arc<Self>, credential: &str) -> Result<Subscription, HubError> {
        if self.state().shutting_down {
            return Err(HubError::ShuttingDown);
        }

        let user = match self.gate.authorize(credential) {
            Ok(user) => user,
            Err(err) => {
                self.stats.record_subscribe(false);
                match &err {
                    GateError::InvalidToken => debug!("Subscription rejected: {}", err),
                    GateError::Unavailable(_) => warn!("Subscription rejected: {}", err),
                }
                return Err(HubError::Unauthorized(err.to_string()));
            }
        };

        let mut state = self.state();
        if state.shutting_down {
            return Err(HubError::ShuttingDown);
        }

        let id = state.next_id;
        state.next_id += 1;
        let queue = Arc::new(SubscriberQueue::new(
            id,
            user,
            self.config.queue_capacity,
            OverflowWindow::from_secs(
                self.config.max_overflows,
                self.config.overflow_window_secs,
            ),
        ));
        queue.set_state(SubscriberState::Authorized);

        // Snapshot under the state lock so no publish can slip in between
        let backlog = state
            .history
            .before(state.current.timestamp, self.config.snapshot_history);
        queue.push(Arc::clone(&state.current));
        queue.set_state(SubscriberState::Live);
        state.subscribers.insert(id, Arc::clone(&queue));
        drop(state);

        self.stats.record_subscribe(true);
        info!("Subscriber {} admitted for user {}", id, queue.user());
        Ok(Subscription::new(queue, backlog, Arc::downgrade(self)))
    }

    /// Remove a subscriber and close its queue; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriberId) {
        let removed = self.state().subscribers.remove(&id);
        if let Some(queue) = removed {
            queue.close(CloseReason::Unsubscribed);
            info!("Subscriber {} left", id);
        }
    }

    /// The current record
    pub fn current(&self) -> Arc<HealthRecord> {
        Arc::clone(&self.state().current)
    }

    /// Every retained record, oldest first
    pub fn history(&self) -> Vec<Arc<HealthRecord>> {
        self.state().history.all()
    }

    /// The newest `count` retained records, oldest first
    pub fn recent_history(&self, count: usize) -> Vec<Arc<HealthRecord>> {
        self.state().history.latest(count)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Close every subscriber queue and refuse new subscribers
    pub fn shutdown(&self) {
        let subscribers: Vec<Arc<SubscriberQueue>> = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.subscribers.drain().map(|(_, queue)| queue).collect()
        };

        for queue in &subscribers {
            queue.close(CloseReason::Shutdown);
        }
        info!("Hub shut down, closed {} subscriber(s)", subscribers.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecvError;
    use crate::events::{metric, MetricHealth, Severity};
    use crate::gate::{MockSessionGate, UserId};
    use chrono::{DateTime, Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
    }

    fn record(second: i64, overall: Severity) -> HealthRecord {
        let mut record = HealthRecord::initial(base() + Duration::seconds(second));
        record.metrics.insert(
            metric::CPU_USAGE.to_string(),
            MetricHealth {
                value: 50.0,
                smoothed: 50.0,
                severity: overall,
                confidence: 1.0,
            },
        );
        record.overall = overall;
        record
    }

    fn gate() -> Arc<dyn SessionGate> {
        let mut gate = MockSessionGate::new();
        gate.expect_authorize().returning(|token| match token {
            "good" => Ok(UserId::from("alice")),
            "other" => Ok(UserId::from("bob")),
            _ => Err(GateError::InvalidToken),
        });
        Arc::new(gate)
    }

    fn hub_with(config: HubConfig) -> Arc<Hub> {
        Hub::new(config, gate(), PipelineStats::new())
    }

    fn hub() -> Arc<Hub> {
        hub_with(HubConfig::default())
    }

    #[test]
    fn test_hub_starts_with_normal_record() {
        let hub = hub();
        let current = hub.current();
        assert_eq!(current.overall, Severity::Normal);
        assert!(current.metrics.is_empty());
        assert!(hub.history().is_empty());
    }

    #[test]
    fn test_new_subscriber_receives_current_immediately() {
        let hub = hub();
        hub.publish(record(0, Severity::Warning)).unwrap();

        let subscription = hub.subscribe("good").unwrap();
        assert_eq!(subscription.state(), SubscriberState::Live);
        assert_eq!(subscription.user(), &UserId::from("alice"));
        let snapshot = subscription.try_recv().unwrap().unwrap();
        assert_eq!(snapshot.overall, Severity::Warning);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_subscriber_before_any_publish_gets_initial_record() {
        let hub = hub();
        let subscription = hub.subscribe("good").unwrap();
        let snapshot = subscription.try_recv().unwrap().unwrap();
        assert_eq!(snapshot.overall, Severity::Normal);
        assert!(subscription.backlog().is_empty());
    }

    #[test]
    fn test_snapshot_backlog_excludes_current() {
        let hub = hub_with(HubConfig {
            snapshot_history: 2,
            ..HubConfig::default()
        });
        for i in 0..5 {
            hub.publish(record(i, Severity::Normal)).unwrap();
        }

        let mut subscription = hub.subscribe("good").unwrap();
        let backlog = subscription.take_backlog();
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].timestamp, base() + Duration::seconds(2));
        assert_eq!(backlog[1].timestamp, base() + Duration::seconds(3));
        assert!(subscription.backlog().is_empty());
    }

    #[test]
    fn test_unauthorized_subscriber_gets_nothing() {
        let hub = hub();
        let result = hub.subscribe("forged");
        assert!(matches!(result, Err(HubError::Unauthorized(_))));
        assert_eq!(hub.subscriber_count(), 0);

        // A publish afterwards reaches nobody
        let report = hub.publish(record(0, Severity::Critical)).unwrap();
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn test_publish_reaches_every_subscriber_in_order() {
        let hub = hub();
        let a = hub.subscribe("good").unwrap();
        let b = hub.subscribe("other").unwrap();
        a.try_recv().unwrap();
        b.try_recv().unwrap();

        for i in 0..3 {
            let report = hub.publish(record(i, Severity::Normal)).unwrap();
            assert_eq!(report.delivered, 2);
        }

        for subscription in [&a, &b] {
            let received: Vec<_> = std::iter::from_fn(|| subscription.try_recv().unwrap())
                .map(|r| r.timestamp)
                .collect();
            assert_eq!(received.len(), 3);
            assert!(received.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_stale_record_is_rejected() {
        let hub = hub();
        hub.publish(record(10, Severity::Normal)).unwrap();
        let result = hub.publish(record(5, Severity::Critical));
        assert!(matches!(result, Err(HubError::StaleRecord { .. })));
        assert_eq!(hub.current().timestamp, base() + Duration::seconds(10));
        assert_eq!(hub.history().len(), 1);

        // Equal timestamps are not stale
        assert!(hub.publish(record(10, Severity::Warning)).is_ok());
    }

    #[test]
    fn test_history_capacity() {
        let hub = hub_with(HubConfig {
            history_capacity: 4,
            ..HubConfig::default()
        });
        for i in 0..10 {
            hub.publish(record(i, Severity::Normal)).unwrap();
        }
        let history = hub.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].timestamp, base() + Duration::seconds(6));
        assert_eq!(hub.recent_history(2).len(), 2);
    }

    #[test]
    fn test_slow_subscriber_drops_oldest_then_is_disconnected() {
        let hub = hub_with(HubConfig {
            queue_capacity: 2,
            max_overflows: 3,
            ..HubConfig::default()
        });
        let slow = hub.subscribe("good").unwrap();
        let fast = hub.subscribe("other").unwrap();
        fast.try_recv().unwrap();

        let mut disconnected = Vec::new();
        let mut fast_received = Vec::new();
        for i in 0..8 {
            let report = hub.publish(record(i, Severity::Normal)).unwrap();
            disconnected.extend(report.disconnected);
            while let Some(r) = fast.try_recv().unwrap() {
                fast_received.push(r.timestamp);
            }
        }

        assert_eq!(disconnected, vec![slow.id()]);
        assert_eq!(
            slow.state(),
            SubscriberState::Closed(CloseReason::Overwhelmed)
        );
        assert_eq!(hub.subscriber_count(), 1);

        // The fast subscriber saw every update, in order
        assert_eq!(fast_received.len(), 8);
        assert!(fast_received.windows(2).all(|w| w[0] < w[1]));

        // The slow one drains what was left, then learns why it was closed
        while let Ok(Some(_)) = slow.try_recv() {}
        assert_eq!(
            slow.try_recv(),
            Err(RecvError::Closed(CloseReason::Overwhelmed))
        );
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let hub = hub();
        let subscription = hub.subscribe("good").unwrap();
        assert_eq!(hub.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(hub.subscriber_count(), 0);

        // Unsubscribing an unknown id is a no-op
        hub.unsubscribe(12345);
    }

    #[test]
    fn test_shutdown_closes_subscribers_and_refuses_new_ones() {
        let hub = hub();
        let subscription = hub.subscribe("good").unwrap();
        hub.shutdown();

        // The snapshot still drains before the close is reported
        assert!(subscription.try_recv().unwrap().is_some());
        assert_eq!(
            subscription.try_recv(),
            Err(RecvError::Closed(CloseReason::Shutdown))
        );
        assert!(matches!(hub.subscribe("good"), Err(HubError::ShuttingDown)));
        assert!(matches!(
            hub.publish(record(1, Severity::Normal)),
            Err(HubError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_async_recv_sees_publish() {
        let hub = hub();
        let subscription = hub.subscribe("good").unwrap();
        subscription.recv().await.unwrap();

        let publisher = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                hub.publish(record(1, Severity::Critical)).unwrap();
            })
        };

        let received = subscription.recv().await.unwrap();
        assert_eq!(received.overall, Severity::Critical);
        publisher.join().unwrap();
    }

    #[test]
    fn test_concurrent_subscribe_and_publish() {
        let hub = hub_with(HubConfig {
            queue_capacity: 1024,
            ..HubConfig::default()
        });
        let records = 500;

        let steady = hub.subscribe("good").unwrap();
        let publisher = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for i in 1..=records {
                    hub.publish(record(i, Severity::Normal)).unwrap();
                }
            })
        };

        let churners: Vec<_> = (0..4)
            .map(|_| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let subscription = hub.subscribe("other").unwrap();
                        let mut last = None;
                        for _ in 0..10 {
                            match subscription.try_recv() {
                                Ok(Some(record)) => {
                                    assert!(last.map_or(true, |t| t <= record.timestamp));
                                    last = Some(record.timestamp);
                                }
                                Ok(None) => std::thread::yield_now(),
                                Err(e) => panic!("live subscription closed: {}", e),
                            }
                        }
                        // First record is always the snapshot
                        assert!(last.is_some());
                        drop(subscription);
                    }
                })
            })
            .collect();

        publisher.join().unwrap();
        for churner in churners {
            churner.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Ok(Some(record)) = steady.try_recv() {
            seen.push(record.timestamp);
        }
        // Initial snapshot plus every published record, in order
        assert_eq!(seen.len(), records as usize + 1);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(steady.dropped(), 0);

        drop(steady);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
