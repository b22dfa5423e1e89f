use std::fmt;

/// Handshake progress of one peer session.
///
/// ```text
/// Idle -> OfferSent (initiator) ----------------> Connecting -> Open -> Closed
/// Idle -> OfferReceived (responder) -> AnswerExchanged ----^
/// ```
///
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Closed | HandshakeState::Failed)
    }

    /// Still working towards an open channel.
    pub fn is_handshaking(&self) -> bool {
        !self.is_terminal() && *self != HandshakeState::Open
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::OfferSent => "offer_sent",
            HandshakeState::OfferReceived => "offer_received",
            HandshakeState::AnswerExchanged => "answer_exchanged",
            HandshakeState::Connecting => "connecting",
            HandshakeState::Open => "open",
            HandshakeState::Closed => "closed",
            HandshakeState::Failed => "failed",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the handshake a session plays. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends the offer.
    Initiator,
    /// Answers the offer.
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called locally.
    LocalClose,
    /// The remote peer sent bye or closed its channel.
    RemoteClosed,
    /// The handshake did not reach `Open` in time.
    HandshakeTimeout,
    /// The transport or channel reported an error.
    TransportFailure(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalClose => f.write_str("local close"),
            DisconnectReason::RemoteClosed => f.write_str("remote closed"),
            DisconnectReason::HandshakeTimeout => f.write_str("handshake timeout"),
            DisconnectReason::TransportFailure(e) => write!(f, "transport failure: {e}"),
        }
    }
}
