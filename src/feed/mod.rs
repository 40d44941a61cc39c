/// Wire messages of the live feed
pub mod protocol;

/// WebSocket server fanning hub records out to viewers
pub mod server;

pub use protocol::{parse_client_message, ClientMessage, FeedMessage};
pub use server::{request_token, FeedServer, CLOSE_OVERWHELMED};
