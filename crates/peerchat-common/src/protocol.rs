//! Relay wire protocol.
//!
//! Everything that crosses the relay is a [`RelayMessage`] encoded as a single JSON
//! object, one object per line or per WebSocket text frame:
//!
//! ```text
//! {"sessionId":"s1","kind":"offer","payload":"..."}
//! {"sessionId":"s1","kind":"candidate","payload":"..."}
//! ```
//!
//! The relay never looks inside `payload`. Decoding and re-encoding a message
//! reproduces every field byte-for-byte.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Largest offer/answer payload accepted by the relay.
pub const MAX_DESCRIPTION_BYTES: usize = 32 * 1024;

/// Largest candidate payload accepted by the relay.
pub const MAX_CANDIDATE_BYTES: usize = 4096;

/// Largest encoded frame (line or WebSocket text message).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Kind of handshake message carried by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Initiator's connection-setup description.
    Offer,
    /// Responder's connection-setup description.
    Answer,
    /// One trickled network-reachability candidate.
    Candidate,
    /// Sender is tearing the session down.
    Bye,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::Bye => "bye",
        }
    }

    /// Payload size limit for this kind.
    pub fn max_payload_bytes(&self) -> usize {
        match self {
            MessageKind::Offer | MessageKind::Answer => MAX_DESCRIPTION_BYTES,
            MessageKind::Candidate | MessageKind::Bye => MAX_CANDIDATE_BYTES,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handshake message routed between the two participants of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub session_id: String,
    pub kind: MessageKind,
    pub payload: String,
}

impl RelayMessage {
    pub fn new(session_id: impl Into<String>, kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            payload: payload.into(),
        }
    }

    pub fn offer(session_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(session_id, MessageKind::Offer, payload)
    }

    pub fn answer(session_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(session_id, MessageKind::Answer, payload)
    }

    pub fn candidate(session_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(session_id, MessageKind::Candidate, payload)
    }

    pub fn bye(session_id: impl Into<String>) -> Self {
        Self::new(session_id, MessageKind::Bye, "")
    }

    /// Encode as a single JSON object without a trailing newline.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encode as one newline-terminated line.
    pub fn encode_line(&self) -> Result<String> {
        let mut line = self.encode()?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one frame or line. A trailing `\n` / `\r\n` is ignored.
    pub fn decode(text: &str) -> Result<Self> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(Error::protocol(format!(
                "frame too large: {} bytes",
                text.len()
            )));
        }
        let text = text.trim_end_matches(['\n', '\r']);
        let message: RelayMessage = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    /// Check the session id and payload size limits.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_session_id(&self.session_id) {
            return Err(Error::protocol(format!(
                "invalid session id {:?}",
                self.session_id
            )));
        }
        if self.payload.len() > self.kind.max_payload_bytes() {
            return Err(Error::protocol(format!(
                "{} payload too large: {} bytes",
                self.kind,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// Session ids are opaque: any non-empty string of at most
/// [`MAX_SESSION_ID_LEN`] bytes. Transports that put the id in a URL encode it.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_SESSION_ID_LEN
}

/// Decode a newline-delimited stream, skipping blank lines.
pub fn decode_lines(input: &str) -> impl Iterator<Item = Result<RelayMessage>> + '_ {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(RelayMessage::decode)
}
