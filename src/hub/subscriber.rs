//! Per-subscriber delivery queues
//!
//! Every admitted subscriber owns a bounded [`SubscriberQueue`]. The hub pushes
//! into it without ever blocking: a full queue loses its oldest update, and a
//! subscriber that keeps overflowing is closed as overwhelmed.

use crate::error::RecvError;
use crate::events::HealthRecord;
use crate::gate::UserId;
use crate::hub::overflow::OverflowWindow;
use crate::hub::Hub;
use log::debug;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;

/// Identifier the hub assigns to each admitted subscriber
pub type SubscriberId = u64;

/// Why a subscriber queue was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber left, or its handle was dropped
    Unsubscribed,
    /// The subscriber could not keep up and was disconnected
    Overwhelmed,
    /// The hub is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::Overwhelmed => "subscriber overwhelmed",
            CloseReason::Shutdown => "hub shutting down",
        };
        f.write_str(text)
    }
}

/// Lifecycle of a subscriber
///
/// `Connecting` and `Authorized` are passed through inside
/// [`Hub::subscribe`]; a queue handed to a caller is `Live` until it reaches
/// the terminal `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Authorized,
    Live,
    Closed(CloseReason),
}

/// Result of pushing one record into a subscriber queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Record queued without loss
    Delivered,
    /// Record queued after dropping the oldest queued update
    DroppedOldest,
    /// The overflow tolerance was exceeded and the queue is now closed
    Overwhelmed,
    /// The queue was already closed; nothing was queued
    Closed,
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<Arc<HealthRecord>>,
    state: SubscriberState,
    overflow: OverflowWindow,
    dropped: u64,
}

/// Bounded, drop-oldest queue feeding one subscriber
#[derive(Debug)]
pub struct SubscriberQueue {
    id: SubscriberId,
    user: UserId,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SubscriberQueue {
    pub fn new(id: SubscriberId, user: UserId, capacity: usize, overflow: OverflowWindow) -> Self {
        Self {
            id,
            user,
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.max(1)),
                state: SubscriberState::Connecting,
                overflow,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    fn inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the lifecycle; a closed queue never leaves `Closed`
    pub(crate) fn set_state(&self, state: SubscriberState) {
        let mut inner = self.inner();
        if !matches!(inner.state, SubscriberState::Closed(_)) {
            inner.state = state;
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.inner().state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SubscriberState::Closed(_))
    }

    /// Updates this subscriber lost to overflow
    pub fn dropped(&self) -> u64 {
        self.inner().dropped
    }

    /// Records waiting to be received
    pub fn len(&self) -> usize {
        self.inner().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().items.is_empty()
    }

    /// Queue a record without blocking
    pub fn push(&self, record: Arc<HealthRecord>) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner();
            if matches!(inner.state, SubscriberState::Closed(_)) {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Delivered;
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.dropped += 1;
                outcome = PushOutcome::DroppedOldest;
                if inner.overflow.record() {
                    inner.state = SubscriberState::Closed(CloseReason::Overwhelmed);
                    outcome = PushOutcome::Overwhelmed;
                }
            }
            inner.items.push_back(record);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Close the queue; already queued records can still be received
    ///
    /// # Returns
    ///
    /// `true` if this call closed the queue, `false` if it was already closed
    pub fn close(&self, reason: CloseReason) -> bool {
        let closed_now = {
            let mut inner = self.inner();
            if matches!(inner.state, SubscriberState::Closed(_)) {
                false
            } else {
                inner.state = SubscriberState::Closed(reason);
                true
            }
        };
        if closed_now {
            debug!("Subscriber {} closed: {}", self.id, reason);
            self.notify.notify_one();
        }
        closed_now
    }

    /// Take the next record if one is queued
    ///
    /// # Returns
    ///
    /// * `Ok(Some(record))` - next record in publish order
    /// * `Ok(None)` - nothing queued yet
    /// * `Err(RecvError::Closed)` - the queue is closed and fully drained
    pub fn try_recv(&self) -> Result<Option<Arc<HealthRecord>>, RecvError> {
        let mut inner = self.inner();
        if let Some(record) = inner.items.pop_front() {
            return Ok(Some(record));
        }
        match inner.state {
            SubscriberState::Closed(reason) => Err(RecvError::Closed(reason)),
            _ => Ok(None),
        }
    }

    /// Wait for the next record
    pub async fn recv(&self) -> Result<Arc<HealthRecord>, RecvError> {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed
            let notified = self.notify.notified();
            if let Some(record) = self.try_recv()? {
                return Ok(record);
            }
            notified.await;
        }
    }
}

/// Handle held by an admitted subscriber
///
/// Dropping the handle unsubscribes it from the hub.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    backlog: Vec<Arc<HealthRecord>>,
    hub: Weak<Hub>,
}

impl Subscription {
    pub(crate) fn new(
        queue: Arc<SubscriberQueue>,
        backlog: Vec<Arc<HealthRecord>>,
        hub: Weak<Hub>,
    ) -> Self {
        Self {
            queue,
            backlog,
            hub,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.queue.id()
    }

    pub fn user(&self) -> &UserId {
        self.queue.user()
    }

    pub fn state(&self) -> SubscriberState {
        self.queue.state()
    }

    /// History records older than the snapshot, oldest first
    pub fn backlog(&self) -> &[Arc<HealthRecord>] {
        &self.backlog
    }

    /// Take ownership of the backlog, leaving it empty
    pub fn take_backlog(&mut self) -> Vec<Arc<HealthRecord>> {
        std::mem::take(&mut self.backlog)
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn try_recv(&self) -> Result<Option<Arc<HealthRecord>>, RecvError> {
        self.queue.try_recv()
    }

    pub async fn recv(&self) -> Result<Arc<HealthRecord>, RecvError> {
        self.queue.recv().await
    }

    /// Leave the hub explicitly
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.queue.id())
            .field("user", self.queue.user())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        match self.hub.upgrade() {
            Some(hub) => hub.unsubscribe(self.queue.id()),
            None => {
                self.queue.close(CloseReason::Unsubscribed);
            }
        }
    }
}
