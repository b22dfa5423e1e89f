//! Per-peer handshake state machine.
//!
//! A [`PeerSession`] is owned by exactly one actor task (see [`crate::manager`]),
//! so none of its methods need locking. Each method checks the current state,
//! drives the transport link, emits relay messages and application events, and
//! transitions. Every terminal path releases the channel and the link.

use std::sync::Arc;

use peerchat_common::RelayMessage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::message::{decode_frame, ChatMessage};
use crate::state::{DisconnectReason, HandshakeState, Role};
use crate::transport::{EventSender, MessageChannel, PeerLink, Transport, TransportError};

/// Offer payload: the description plus the sender's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferEnvelope {
    pub from: String,
    pub description: String,
}

impl OfferEnvelope {
    pub fn encode(&self) -> peerchat_common::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> peerchat_common::Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Outcome of a handshake as seen by whoever waits on it.
pub(crate) type Established = oneshot::Sender<Result<(), SessionError>>;

pub(crate) struct SessionOutputs {
    pub signals: mpsc::Sender<RelayMessage>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub transport: Arc<dyn Transport>,
    pub transport_events: EventSender,
}

pub struct PeerSession {
    session_id: String,
    local_id: String,
    peer_id: Option<String>,
    role: Role,
    state: HandshakeState,
    state_tx: watch::Sender<HandshakeState>,
    local_description: Option<String>,
    remote_description: Option<String>,
    pending_candidates: Vec<String>,
    link: Option<Box<dyn PeerLink>>,
    channel: Option<Box<dyn MessageChannel>>,
    outputs: SessionOutputs,
    established: Option<Established>,
    created_at: Instant,
}

impl PeerSession {
    pub(crate) fn new(
        session_id: String,
        local_id: String,
        peer_id: Option<String>,
        role: Role,
        state_tx: watch::Sender<HandshakeState>,
        outputs: SessionOutputs,
    ) -> Self {
        Self {
            session_id,
            local_id,
            peer_id,
            role,
            state: HandshakeState::Idle,
            state_tx,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            link: None,
            channel: None,
            outputs,
            established: None,
            created_at: Instant::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn pending_candidates(&self) -> &[String] {
        &self.pending_candidates
    }

    pub(crate) fn set_established(&mut self, tx: Established) {
        self.established = Some(tx);
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(
            "session {} ({}): {} -> {}",
            self.session_id, self.role, self.state, next
        );
        self.state = next;
        let _ = self.state_tx.send(next);
    }

    async fn signal(&self, message: RelayMessage) {
        let kind = message.kind;
        if self.outputs.signals.send(message).await.is_err() {
            warn!(
                "signal queue closed, dropping {} for session {}",
                kind, self.session_id
            );
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.outputs.events.send(event);
    }

    async fn open_link(&mut self) -> Result<&mut Box<dyn PeerLink>, SessionError> {
        if self.link.is_none() {
            let link = self
                .outputs
                .transport
                .open(
                    &self.session_id,
                    self.role,
                    self.outputs.transport_events.clone(),
                )
                .await?;
            self.link = Some(link);
        }
        self.link
            .as_mut()
            .ok_or_else(|| SessionError::protocol("link unavailable"))
    }

    /// Initiator: create the local offer and send it. `Idle -> OfferSent`.
    pub async fn start_offer(&mut self) -> Result<(), SessionError> {
        if self.role != Role::Initiator || self.state != HandshakeState::Idle {
            return Err(SessionError::AlreadyConnecting);
        }
        let description = match self.open_link().await {
            Ok(link) => link.create_offer().await,
            Err(err) => return self.fail_with(err).await,
        };
        let description = match description {
            Ok(d) => d,
            Err(err) => return self.fail_with(err.into()).await,
        };

        let payload = OfferEnvelope {
            from: self.local_id.clone(),
            description: description.clone(),
        }
        .encode()?;
        self.local_description = Some(description);
        self.transition(HandshakeState::OfferSent);
        self.signal(RelayMessage::offer(&self.session_id, payload))
            .await;
        info!("sent offer for session {}", self.session_id);
        Ok(())
    }

    /// Responder: apply the remote offer, answer it and flush queued candidates.
    /// `Idle -> OfferReceived -> AnswerExchanged`.
    pub async fn accept_offer(&mut self, offer: OfferEnvelope) -> Result<(), SessionError> {
        if self.role != Role::Responder || self.state != HandshakeState::Idle {
            return Err(SessionError::protocol(format!(
                "duplicate offer in state {}",
                self.state
            )));
        }
        self.peer_id = Some(offer.from);
        self.remote_description = Some(offer.description.clone());
        self.transition(HandshakeState::OfferReceived);

        let answer = match self.open_link().await {
            Ok(link) => link.create_answer(&offer.description).await,
            Err(err) => return self.fail_with(err).await,
        };
        let answer = match answer {
            Ok(a) => a,
            Err(err) => return self.fail_with(err.into()).await,
        };

        self.local_description = Some(answer.clone());
        self.transition(HandshakeState::AnswerExchanged);
        self.signal(RelayMessage::answer(&self.session_id, answer))
            .await;
        info!("answered offer for session {}", self.session_id);
        self.flush_candidates().await
    }

    /// Initiator: apply the remote answer. `OfferSent -> Connecting`.
    pub async fn apply_answer(&mut self, answer: String) -> Result<(), SessionError> {
        if self.state != HandshakeState::OfferSent {
            return Err(SessionError::UnexpectedAnswer);
        }
        let applied = match self.link.as_mut() {
            Some(link) => link.apply_answer(&answer).await,
            None => Err(TransportError::ChannelClosed),
        };
        if let Err(err) = applied {
            return self.fail_with(err.into()).await;
        }
        self.remote_description = Some(answer);
        self.transition(HandshakeState::Connecting);
        self.flush_candidates().await
    }

    /// Apply a remote candidate, or queue it until the remote description is known.
    pub async fn apply_candidate(&mut self, candidate: String) -> Result<(), SessionError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if self.remote_description.is_none() {
            debug!(
                "queueing candidate for session {} ({} pending)",
                self.session_id,
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.add_candidate(&candidate).await?;
        self.candidate_activity();
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &str) -> Result<(), SessionError> {
        let Some(link) = self.link.as_mut() else {
            return Err(SessionError::protocol("no link for candidate"));
        };
        if let Err(err) = link.add_candidate(candidate).await {
            // A single bad candidate is not fatal; others may still connect.
            warn!(
                "candidate rejected for session {}: {}",
                self.session_id, err
            );
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<(), SessionError> {
        if self.pending_candidates.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        debug!(
            "applying {} queued candidates for session {}",
            pending.len(),
            self.session_id
        );
        for candidate in &pending {
            self.add_candidate(candidate).await?;
        }
        self.candidate_activity();
        Ok(())
    }

    fn candidate_activity(&mut self) {
        if self.role == Role::Responder && self.state == HandshakeState::AnswerExchanged {
            self.transition(HandshakeState::Connecting);
        }
    }

    /// Trickle a local candidate to the remote peer.
    pub async fn forward_local_candidate(&mut self, candidate: String) {
        if self.state.is_terminal() {
            return;
        }
        self.signal(RelayMessage::candidate(&self.session_id, candidate))
            .await;
        self.candidate_activity();
    }

    /// The transport reports the channel open. `Connecting -> Open`.
    pub async fn channel_ready(&mut self) -> Result<(), SessionError> {
        match self.state {
            HandshakeState::Open => return Ok(()),
            HandshakeState::AnswerExchanged | HandshakeState::Connecting => {}
            other => {
                return Err(SessionError::protocol(format!(
                    "channel ready in state {other}"
                )))
            }
        }
        let channel = match self.link.as_mut() {
            Some(link) => link.open_channel().await,
            None => Err(TransportError::ChannelNotReady),
        };
        let channel = match channel {
            Ok(c) => c,
            Err(err) => return self.fail_with(err.into()).await,
        };
        self.channel = Some(channel);
        self.transition(HandshakeState::Open);

        let peer_id = self.peer_id.clone().unwrap_or_default();
        info!("session {} open with {}", self.session_id, peer_id);
        self.emit(SessionEvent::PeerConnected {
            session_id: self.session_id.clone(),
            peer_id,
        });
        if let Some(tx) = self.established.take() {
            let _ = tx.send(Ok(()));
        }
        Ok(())
    }

    /// Send one chat message. Only valid while `Open`.
    pub async fn send(&mut self, text: &str) -> Result<(), SessionError> {
        if self.state != HandshakeState::Open {
            return Err(SessionError::ChannelNotOpen);
        }
        let Some(channel) = self.channel.as_ref() else {
            return Err(SessionError::ChannelNotOpen);
        };
        let frame = ChatMessage::text(text, &self.local_id).encode()?;
        if let Err(err) = channel.send_text(&frame).await {
            self.fail_with(err.clone().into()).await.ok();
            return Err(err.into());
        }
        Ok(())
    }

    /// Deliver one incoming channel frame to the application.
    pub fn receive(&self, raw: &str) {
        if self.state != HandshakeState::Open {
            debug!(
                "dropping channel message for session {} in state {}",
                self.session_id, self.state
            );
            return;
        }
        if let Some(incoming) = decode_frame(raw) {
            self.emit(SessionEvent::MessageReceived {
                session_id: self.session_id.clone(),
                text: incoming.text,
                timestamp: incoming.timestamp,
                sender: incoming.sender.or_else(|| self.peer_id.clone()),
            });
        }
    }

    /// The channel closed underneath us.
    pub async fn channel_closed(&mut self) {
        if self.state == HandshakeState::Open {
            self.terminate(HandshakeState::Closed, DisconnectReason::RemoteClosed, false)
                .await;
        } else if !self.state.is_terminal() {
            self.terminate(
                HandshakeState::Failed,
                DisconnectReason::TransportFailure("channel closed during handshake".into()),
                true,
            )
            .await;
        }
    }

    async fn fail_with(&mut self, err: SessionError) -> Result<(), SessionError> {
        warn!("session {} failed: {}", self.session_id, err);
        self.terminate(
            HandshakeState::Failed,
            DisconnectReason::TransportFailure(err.to_string()),
            true,
        )
        .await;
        Err(err)
    }

    /// A responder created by early candidates that has not seen an offer.
    pub fn is_placeholder(&self) -> bool {
        self.role == Role::Responder
            && self.state == HandshakeState::Idle
            && self.peer_id.is_none()
    }

    /// Whether the remote peer may hold state for this session.
    fn remote_may_be_live(&self) -> bool {
        !(self.role == Role::Initiator && self.state == HandshakeState::Idle)
    }

    /// End the session: release resources, notify the peer if asked, emit
    /// `PeerDisconnected`. Does nothing once terminal.
    pub async fn terminate(
        &mut self,
        outcome: HandshakeState,
        reason: DisconnectReason,
        notify_remote: bool,
    ) {
        if self.state.is_terminal() {
            return;
        }
        if notify_remote && self.remote_may_be_live() {
            self.signal(RelayMessage::bye(&self.session_id)).await;
        }
        self.release().await;
        self.transition(outcome);

        info!("session {} ended: {}", self.session_id, reason);
        if let Some(tx) = self.established.take() {
            let err = match &reason {
                DisconnectReason::HandshakeTimeout => SessionError::HandshakeTimeout,
                DisconnectReason::TransportFailure(e) => {
                    SessionError::Transport(TransportError::Failed(e.clone()))
                }
                DisconnectReason::LocalClose | DisconnectReason::RemoteClosed => {
                    SessionError::SessionClosed
                }
            };
            let _ = tx.send(Err(err));
        }
        self.emit(SessionEvent::PeerDisconnected {
            session_id: self.session_id.clone(),
            reason,
        });
    }

    /// Drop the session without telling anyone: no bye, no event.
    pub async fn abandon(&mut self, winner: &str) {
        if self.state.is_terminal() {
            return;
        }
        info!(
            "session {} superseded by {} after simultaneous connect",
            self.session_id, winner
        );
        self.release().await;
        self.transition(HandshakeState::Closed);
        if let Some(tx) = self.established.take() {
            let _ = tx.send(Err(SessionError::Superseded {
                by: winner.to_string(),
            }));
        }
    }

    /// Drop a placeholder whose offer never came. Nobody was told it
    /// existed, so no bye and no event.
    pub async fn expire(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            "dropping {} unclaimed candidates for session {}",
            self.pending_candidates.len(),
            self.session_id
        );
        self.release().await;
        self.transition(HandshakeState::Closed);
        if let Some(tx) = self.established.take() {
            let _ = tx.send(Err(SessionError::SessionClosed));
        }
    }

    async fn release(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.pending_candidates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, TransportEvent};

    struct Harness {
        session: PeerSession,
        signals: mpsc::Receiver<RelayMessage>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness(network: &MemoryNetwork, owner: &str, role: Role) -> Harness {
        let (signals_tx, signals) = mpsc::channel(16);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (te_tx, transport_events) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(HandshakeState::Idle);
        let outputs = SessionOutputs {
            signals: signals_tx,
            events: events_tx,
            transport: Arc::new(network.transport(owner)),
            transport_events: te_tx,
        };
        let peer = (role == Role::Initiator).then(|| "bob".to_string());
        Harness {
            session: PeerSession::new("s1".into(), owner.into(), peer, role, state_tx, outputs),
            signals,
            events,
            transport_events,
        }
    }

    #[tokio::test]
    async fn test_offer_carries_identity() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "alice", Role::Initiator);
        h.session.start_offer().await.unwrap();
        assert_eq!(h.session.state(), HandshakeState::OfferSent);

        let msg = h.signals.recv().await.unwrap();
        let offer = OfferEnvelope::decode(&msg.payload).unwrap();
        assert_eq!(offer.from, "alice");
        assert!(offer.description.starts_with("memory-offer"));
        assert!(matches!(
            h.session.start_offer().await,
            Err(SessionError::AlreadyConnecting)
        ));
    }

    #[tokio::test]
    async fn test_answer_only_valid_in_offer_sent() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "alice", Role::Initiator);
        assert_eq!(
            h.session.apply_answer("x".into()).await,
            Err(SessionError::UnexpectedAnswer)
        );
        h.session.start_offer().await.unwrap();
        h.session.apply_answer("x".into()).await.unwrap();
        assert_eq!(h.session.state(), HandshakeState::Connecting);
        assert_eq!(
            h.session.apply_answer("y".into()).await,
            Err(SessionError::UnexpectedAnswer)
        );
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "bob", Role::Responder);
        for c in ["c1", "c2", "c3"] {
            h.session.apply_candidate(c.into()).await.unwrap();
        }
        assert_eq!(h.session.pending_candidates(), ["c1", "c2", "c3"]);

        h.session
            .accept_offer(OfferEnvelope {
                from: "alice".into(),
                description: "offer".into(),
            })
            .await
            .unwrap();
        assert!(h.session.pending_candidates().is_empty());
        assert_eq!(h.session.state(), HandshakeState::Connecting);
        assert_eq!(
            network.applied_candidates("s1", "bob"),
            vec!["c1", "c2", "c3"]
        );
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "alice", Role::Initiator);
        assert_eq!(h.session.send("hi").await, Err(SessionError::ChannelNotOpen));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_sends_bye_once() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "alice", Role::Initiator);
        h.session.start_offer().await.unwrap();
        let _offer = h.signals.recv().await.unwrap();

        for _ in 0..3 {
            h.session
                .terminate(HandshakeState::Closed, DisconnectReason::LocalClose, true)
                .await;
        }
        assert_eq!(h.signals.recv().await.unwrap(), RelayMessage::bye("s1"));
        assert!(h.signals.try_recv().is_err());
        assert_eq!(network.link_count("s1"), 0);

        let mut disconnects = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SessionEvent::PeerDisconnected { .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_abandon_is_silent() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "alice", Role::Initiator);
        let (tx, rx) = oneshot::channel();
        h.session.set_established(tx);
        h.session.start_offer().await.unwrap();
        let _offer = h.signals.recv().await.unwrap();

        h.session.abandon("s0").await;
        assert_eq!(h.session.state(), HandshakeState::Closed);
        assert!(h.signals.try_recv().is_err());
        assert!(h.events.try_recv().is_err());
        assert_eq!(
            rx.await.unwrap(),
            Err(SessionError::Superseded { by: "s0".into() })
        );
        // The local candidate emitted with the offer is still queued; it is never sent.
        assert!(h.transport_events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_expired_placeholder_is_silent() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "bob", Role::Responder);
        h.session.apply_candidate("c1".into()).await.unwrap();
        assert!(h.session.is_placeholder());

        h.session.expire().await;
        assert_eq!(h.session.state(), HandshakeState::Closed);
        assert!(h.session.pending_candidates().is_empty());
        assert!(h.signals.try_recv().is_err());
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_answered_responder_is_not_placeholder() {
        let network = MemoryNetwork::new();
        let mut h = harness(&network, "bob", Role::Responder);
        h.session
            .accept_offer(OfferEnvelope {
                from: "alice".into(),
                description: "offer".into(),
            })
            .await
            .unwrap();
        assert!(!h.session.is_placeholder());
    }
}
