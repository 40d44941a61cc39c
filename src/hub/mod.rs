//! Broadcast hub
//!
//! Store-and-forward fan-out of health records to authorized subscribers,
//! with bounded history and a drop-oldest policy for slow readers.

pub mod broadcast_hub;
pub mod history;
pub mod overflow;
pub mod subscriber;

pub use broadcast_hub::{Hub, PublishReport};
pub use history::HistoryRing;
pub use overflow::OverflowWindow;
pub use subscriber::{
    CloseReason, PushOutcome, SubscriberId, SubscriberQueue, SubscriberState, Subscription,
};
