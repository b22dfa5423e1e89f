//! Chat message envelope carried over the peer channel.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

const TEXT_TYPE: &str = "text";

/// `{"type":"text","content":...,"timestamp":<unix ms>,"sender":...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub sender: String,
}

impl ChatMessage {
    pub fn text(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            kind: TEXT_TYPE.to_string(),
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
            sender: sender.into(),
        }
    }

    pub fn encode(&self) -> peerchat_common::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// A decoded incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Identity named by the envelope; `None` for plain text.
    pub sender: Option<String>,
}

/// Decode a channel frame.
///
/// Frames that are not envelopes are taken as plain text stamped with the local
/// receive time. Envelopes of any type other than `text` yield `None`.
pub fn decode_frame(raw: &str) -> Option<Incoming> {
    match serde_json::from_str::<ChatMessage>(raw) {
        Ok(msg) if msg.kind == TEXT_TYPE => Some(Incoming {
            timestamp: msg.sent_at(),
            sender: (!msg.sender.is_empty()).then_some(msg.sender),
            text: msg.content,
        }),
        Ok(msg) => {
            debug!("ignoring unsupported chat message type {:?}", msg.kind);
            None
        }
        Err(_) => Some(Incoming {
            text: raw.to_string(),
            timestamp: Utc::now(),
            sender: None,
        }),
    }
}
