//! Bounded record history
//!
//! This module provides the HistoryRing which keeps the most recent health
//! records in publish order, evicting the oldest once capacity is reached.

use crate::events::{HealthRecord, Timestamp};
use std::collections::VecDeque;
use std::sync::Arc;

/// Rolling FIFO of published health records
///
/// Records are shared with subscriber queues, so the ring stores them behind
/// an `Arc` and never copies a record after publish.
#[derive(Debug)]
pub struct HistoryRing {
    records: VecDeque<Arc<HealthRecord>>,
    capacity: usize,
}

impl HistoryRing {
    /// Create a new HistoryRing holding at most `capacity` records
    ///
    /// # Examples
    ///
    /// ```
    /// use kernel_health::hub::HistoryRing;
    ///
    /// let ring = HistoryRing::new(300);
    /// assert!(ring.is_empty());
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a record, evicting the oldest entries beyond capacity
    ///
    /// # Returns
    ///
    /// Number of records evicted
    pub fn push(&mut self, record: Arc<HealthRecord>) -> usize {
        self.records.push_back(record);
        let mut evicted = 0;
        while self.records.len() > self.capacity {
            self.records.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// All retained records, oldest first
    pub fn all(&self) -> Vec<Arc<HealthRecord>> {
        self.records.iter().cloned().collect()
    }

    /// The newest `count` records, oldest first
    pub fn latest(&self, count: usize) -> Vec<Arc<HealthRecord>> {
        let skip = self.records.len().saturating_sub(count);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// Records strictly older than `timestamp`, limited to the newest `count`
    ///
    /// Used to build the backlog that accompanies a snapshot: the current
    /// record itself is excluded because it is delivered separately.
    pub fn before(&self, timestamp: Timestamp, count: usize) -> Vec<Arc<HealthRecord>> {
        let older: Vec<_> = self
            .records
            .iter()
            .filter(|record| record.timestamp < timestamp)
            .cloned()
            .collect();
        let skip = older.len().saturating_sub(count);
        older.into_iter().skip(skip).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn record(second: i64) -> Arc<HealthRecord> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Arc::new(HealthRecord::initial(base + Duration::seconds(second)))
    }

    #[test]
    fn test_push_and_read_back_in_order() {
        let mut ring = HistoryRing::new(10);
        for i in 0..3 {
            ring.push(record(i));
        }
        let all = ring.all();
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp < all[2].timestamp);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut ring = HistoryRing::new(5);
        let mut evicted = 0;
        for i in 0..10 {
            evicted += ring.push(record(i));
        }
        assert_eq!(ring.len(), 5);
        assert_eq!(evicted, 5);
        assert_eq!(ring.all()[0].timestamp, record(5).timestamp);
    }

    #[test]
    fn test_latest() {
        let mut ring = HistoryRing::new(10);
        for i in 0..6 {
            ring.push(record(i));
        }
        let latest = ring.latest(2);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].timestamp, record(4).timestamp);
        assert_eq!(latest[1].timestamp, record(5).timestamp);
        assert_eq!(ring.latest(100).len(), 6);
    }

    #[test]
    fn test_before_excludes_current() {
        let mut ring = HistoryRing::new(10);
        for i in 0..5 {
            ring.push(record(i));
        }
        let backlog = ring.before(record(4).timestamp, 3);
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog[0].timestamp, record(1).timestamp);
        assert_eq!(backlog[2].timestamp, record(3).timestamp);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut ring = HistoryRing::new(0);
        assert_eq!(ring.push(record(0)), 1);
        assert!(ring.is_empty());
    }
}
