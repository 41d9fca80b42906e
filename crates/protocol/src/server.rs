//! Server → Client messages

use serde::{Deserialize, Serialize};

/// Events the server pushes to a chat client, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    SessionStarted(String),
    SessionClosed(String),
    StreamStart,
    Stream(String),
    StreamEnd,
    Error(String),
}
