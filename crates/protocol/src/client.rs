//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Commands a chat client sends over the WebSocket.
///
/// Frames look like `{"type": "chat", "payload": "Hello"}`; commands without
/// a payload carry only the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    Start,
    CloseSession,
    Chat(String),
}
