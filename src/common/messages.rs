//! # Message Protocol
//!
//! Defines the envelope carried inside every frame of the relay protocol.
//!
//! Envelopes are serialized to JSON, compressed, and sent over TCP with a
//! 4-byte length prefix (see [`connection`](super::connection)).
//!
//! Two shapes travel on the wire:
//! ```text
//! client -> server: {"timestamp":"10:00:00","username":"alice","message":"hi","type":"message"}
//! server -> client: {"message":"[10:00:00] alice: hi","type":"broadcast"}
//! ```

use serde::{Deserialize, Serialize};

/// Kind of an envelope, serialized as a lowercase string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Text typed by a user, sent from a client to the server.
    Message,
    /// Preformatted text fanned out by the server to the other clients.
    Broadcast,
    /// Informational notice that did not come from a user.
    System,
}

/// A single chat message as carried inside one frame.
///
/// `timestamp` and `username` are only present on envelopes produced by a
/// client; the server's rebroadcast carries the already formatted text in
/// `message`, so absent fields are omitted when serializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Local wall clock of the sender, formatted `HH:MM:SS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Display name of the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Message text
    pub message: String,
    /// Envelope kind
    #[serde(rename = "type")]
    pub kind: MessageType,
}

impl Envelope {
    /// Build a user message stamped with the current local time.
    ///
    /// # Example
    /// ```ignore
    /// let envelope = Envelope::chat("alice", "hi");
    /// assert_eq!(envelope.kind, MessageType::Message);
    /// ```
    pub fn chat(username: &str, text: &str) -> Self {
        Self::chat_at(&current_time(), username, text)
    }

    /// Build a user message with an explicit `HH:MM:SS` timestamp.
    pub fn chat_at(timestamp: &str, username: &str, text: &str) -> Self {
        Self {
            timestamp: Some(timestamp.to_string()),
            username: Some(username.to_string()),
            message: text.to_string(),
            kind: MessageType::Message,
        }
    }

    /// Build a server rebroadcast carrying preformatted display text.
    pub fn broadcast(text: String) -> Self {
        Self {
            timestamp: None,
            username: None,
            message: text,
            kind: MessageType::Broadcast,
        }
    }

    /// Build a system notice.
    pub fn system(text: &str) -> Self {
        Self {
            timestamp: None,
            username: None,
            message: text.to_string(),
            kind: MessageType::System,
        }
    }

    /// Render the envelope the way other participants see it:
    /// `"[timestamp] username: message"`.
    ///
    /// # Returns
    /// - `Some(String)`: the display line
    /// - `None`: the envelope has no timestamp or no username
    pub fn display_line(&self) -> Option<String> {
        let timestamp = self.timestamp.as_deref()?;
        let username = self.username.as_deref()?;
        Some(format!("[{}] {}: {}", timestamp, username, self.message))
    }
}

/// Current local wall clock formatted as `HH:MM:SS`.
pub fn current_time() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
