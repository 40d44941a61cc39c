use chrono::{DateTime, Duration, Utc};
use log::warn;
use std::collections::VecDeque;

/// Longest sliding window accepted, one day
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Sliding-window counter of queue overflows for one subscriber
///
/// Each time a push finds the subscriber's queue full, the oldest update is
/// dropped and the overflow is recorded here. Once more than `max_overflows`
/// overflows fall inside the window the subscriber is considered overwhelmed.
#[derive(Debug)]
pub struct OverflowWindow {
    /// Overflows tolerated inside one window
    max_overflows: usize,
    /// Length of the sliding window
    window: Duration,
    /// Timestamps of recent overflows
    recent: VecDeque<DateTime<Utc>>,
}

impl Default for OverflowWindow {
    fn default() -> Self {
        Self::new(8, Duration::seconds(30))
    }
}

impl OverflowWindow {
    /// Create a new overflow window
    ///
    /// # Arguments
    ///
    /// * `max_overflows` - Overflows tolerated inside one window
    /// * `window` - Length of the sliding window
    pub fn new(max_overflows: usize, window: Duration) -> Self {
        Self {
            max_overflows,
            window,
            recent: VecDeque::new(),
        }
    }

    /// Create a window from a length in seconds
    ///
    /// Lengths above [`MAX_WINDOW_SECS`] are clamped.
    pub fn from_secs(max_overflows: usize, window_secs: u64) -> Self {
        if window_secs > MAX_WINDOW_SECS {
            warn!(
                "Overflow window of {}s clamped to {}s",
                window_secs, MAX_WINDOW_SECS
            );
        }
        let window = i64::try_from(window_secs.min(MAX_WINDOW_SECS))
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::seconds(30));
        Self::new(max_overflows, window)
    }

    /// Record an overflow at the current time
    ///
    /// # Returns
    ///
    /// `true` if the subscriber has now exceeded its tolerance
    pub fn record(&mut self) -> bool {
        self.record_at(Utc::now())
    }

    /// Record an overflow at a specific time
    ///
    /// This is primarily used for testing with controlled timestamps.
    ///
    /// # Arguments
    ///
    /// * `timestamp` - When the overflow happened
    pub fn record_at(&mut self, timestamp: DateTime<Utc>) -> bool {
        self.recent.push_back(timestamp);
        self.expire(timestamp);
        self.recent.len() > self.max_overflows
    }

    /// Number of overflows inside the window ending at `now`
    pub fn count_at(&mut self, now: DateTime<Utc>) -> usize {
        self.expire(now);
        self.recent.len()
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        // Nothing can have expired if the cutoff is before the representable range
        let Some(cutoff) = now.checked_sub_signed(self.window) else {
            return;
        };
        // Out-of-order timestamps are possible with record_at
        self.recent.retain(|&time| time > cutoff);
    }
}
