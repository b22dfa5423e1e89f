use thiserror::Error;

use crate::transport::TransportError;

/// Errors returned by [`crate::SessionManager`] operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a session with this id already exists")]
    AlreadyConnecting,

    #[error("answer received outside of offer_sent")]
    UnexpectedAnswer,

    #[error("channel is not open")]
    ChannelNotOpen,

    #[error("unknown session")]
    UnknownSession,

    /// Lost a simultaneous-connect race; the peer's session `by` continues instead.
    #[error("superseded by session {by}")]
    Superseded { by: String },

    #[error("session closed")]
    SessionClosed,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

impl From<peerchat_common::Error> for SessionError {
    fn from(err: peerchat_common::Error) -> Self {
        Self::protocol(err)
    }
}
