use chrono::{DateTime, Utc};

use crate::state::DisconnectReason;

/// Notifications delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The channel to `peer_id` is open; `send` now works.
    PeerConnected { session_id: String, peer_id: String },
    /// The session ended. Emitted at most once per session.
    PeerDisconnected {
        session_id: String,
        reason: DisconnectReason,
    },
    /// A chat message arrived over the channel. `sender` is the identity the
    /// envelope names, else the session's peer.
    MessageReceived {
        session_id: String,
        text: String,
        timestamp: DateTime<Utc>,
        sender: Option<String>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::PeerConnected { session_id, .. }
            | SessionEvent::PeerDisconnected { session_id, .. }
            | SessionEvent::MessageReceived { session_id, .. } => session_id,
        }
    }
}
