//! Message envelope exchanged over every relay connection
//!
//! The envelope is JSON on the wire:
//!
//! ```text
//! { "id": "...", "content": "...", "sent_at": 1700000000, "type": 1,
//!   "to": "...", "group_id": "...", "from_user_id": "...", "to_user_id": "..." }
//! ```
//!
//! Routing hints (`to`, `group_id`, `from_user_id`, `to_user_id`) are opaque to
//! the relay and omitted from the wire when unset.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{RelayError, RelayResult};

// =============================================================================
// Message Type
// =============================================================================

/// Kind of a message.
///
/// Values 0 through 6 are reserved. Anything else is carried as
/// [`MessageType::Custom`] and handed to the business handler untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum MessageType {
    /// System notice
    #[default]
    System,
    /// Regular group message
    Broadcast,
    /// Liveness probe
    HeartBeat,
    /// A peer came online
    Connected,
    /// A peer went offline
    Disconnected,
    /// Close request. Never serialized as an envelope; sending it emits a
    /// transport close frame instead.
    Break,
    /// Registration event
    Register,
    /// Extension type defined above the reserved range
    Custom(i64),
}

impl MessageType {
    /// Whether this kind belongs to the reserved enumeration
    pub fn is_reserved(&self) -> bool {
        !matches!(self, MessageType::Custom(_))
    }
}

impl From<i64> for MessageType {
    fn from(value: i64) -> Self {
        match value {
            0 => MessageType::System,
            1 => MessageType::Broadcast,
            2 => MessageType::HeartBeat,
            3 => MessageType::Connected,
            4 => MessageType::Disconnected,
            5 => MessageType::Break,
            6 => MessageType::Register,
            other => MessageType::Custom(other),
        }
    }
}

impl From<MessageType> for i64 {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::System => 0,
            MessageType::Broadcast => 1,
            MessageType::HeartBeat => 2,
            MessageType::Connected => 3,
            MessageType::Disconnected => 4,
            MessageType::Break => 5,
            MessageType::Register => 6,
            MessageType::Custom(value) => value,
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// Typed envelope exchanged between peers and the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender identity or correlation id
    #[serde(default)]
    pub id: String,

    /// Text payload
    #[serde(default)]
    pub content: String,

    /// Unix timestamp (seconds)
    #[serde(default)]
    pub sent_at: i64,

    #[serde(rename = "type", default)]
    pub kind: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<String>,
}

impl Message {
    /// Create a message stamped with the current time
    pub fn new(id: impl Into<String>, kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            sent_at: unix_now(),
            kind,
            to: None,
            group_id: None,
            from_user_id: None,
            to_user_id: None,
        }
    }

    /// Serialize to the JSON wire form
    pub fn encode(&self) -> RelayResult<String> {
        serde_json::to_string(self).map_err(|e| RelayError::Encode(e.to_string()))
    }

    /// Parse an inbound JSON payload
    pub fn decode(raw: &str) -> RelayResult<Self> {
        serde_json::from_str(raw).map_err(|e| RelayError::MalformedEnvelope(e.to_string()))
    }
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
