//! Messages exchanged on the live feed
//!
//! Every server message is a JSON text frame tagged with `type`. Clients may
//! only send keepalives: either a `{"type":"keepalive"}` object or the bare
//! text `ping`.

use crate::events::{HealthRecord, HostInfo};
use serde::{Deserialize, Serialize};

/// Server to client message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// First message after the handshake
    Hello { user: String, host: HostInfo },
    /// Current record plus recent history, sent once after `Hello`
    Snapshot {
        current: HealthRecord,
        backlog: Vec<HealthRecord>,
    },
    Update { record: HealthRecord },
    /// Answer to a keepalive
    Pong,
    /// Sent right before the server closes the connection
    Closing { reason: String },
}

impl FeedMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client to server message
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Keepalive,
}

/// Parse a text frame sent by a client
///
/// # Returns
///
/// `None` for anything that is not a keepalive
pub fn parse_client_message(text: &str) -> Option<ClientMessage> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("ping") {
        return Some(ClientMessage::Keepalive);
    }
    serde_json::from_str(text).ok()
}
