//! Peer transport seam.
//!
//! A [`Transport`] creates one [`PeerLink`] per session. The link produces and
//! consumes connection descriptions and candidates, and once connectivity is
//! established hands out the reliable ordered [`MessageChannel`]. Everything the
//! link learns asynchronously (trickled local candidates, channel open/close,
//! incoming messages, failures) arrives as [`TransportEvent`]s on the sender
//! passed to [`Transport::open`].

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::state::Role;

pub mod memory;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use memory::{MemoryNetwork, MemoryTransport};
#[cfg(feature = "webrtc")]
pub use self::webrtc::{IceServerConfig, WebRtcTransport};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("channel not ready")]
    ChannelNotReady,
    #[error("channel closed")]
    ChannelClosed,
    #[error("transport failed: {0}")]
    Failed(String),
}

impl TransportError {
    pub fn failed(msg: impl fmt::Display) -> Self {
        Self::Failed(msg.to_string())
    }
}

/// Asynchronous notifications from a [`PeerLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate to trickle to the remote peer.
    LocalCandidate(String),
    /// The message channel is open; [`PeerLink::open_channel`] will succeed.
    ChannelOpen,
    /// One text message from the remote peer, in send order.
    ChannelMessage(String),
    /// The channel closed.
    ChannelClosed,
    /// Connectivity was lost or could not be established.
    Failed(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Factory for per-session peer links.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start a link for `session_id` playing `role`.
    async fn open(
        &self,
        session_id: &str,
        role: Role,
        events: EventSender,
    ) -> Result<Box<dyn PeerLink>, TransportError>;
}

/// Connection setup for one session.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create and apply the local offer.
    async fn create_offer(&mut self) -> Result<String, TransportError>;

    /// Apply the remote offer, then create and apply the local answer.
    async fn create_answer(&mut self, offer: &str) -> Result<String, TransportError>;

    /// Apply the remote answer.
    async fn apply_answer(&mut self, answer: &str) -> Result<(), TransportError>;

    /// Apply one remote candidate. Reapplying a duplicate must be harmless.
    async fn add_candidate(&mut self, candidate: &str) -> Result<(), TransportError>;

    /// Take the open message channel.
    async fn open_channel(&mut self) -> Result<Box<dyn MessageChannel>, TransportError>;

    /// Release everything. Safe to call more than once.
    async fn close(&mut self);
}

/// Reliable, ordered text channel to the remote peer.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn close(&self);
}
