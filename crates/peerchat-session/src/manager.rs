//! Session manager: the live session table and one actor task per session.
//!
//! Every public operation looks the session up, hands the actor a command and
//! waits for the reply. Commands for one session are processed strictly in
//! order; different sessions never block each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use peerchat_common::protocol::is_valid_session_id;
use peerchat_common::{MessageKind, RelayMessage};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::session::{OfferEnvelope, PeerSession, SessionOutputs};
use crate::state::{DisconnectReason, HandshakeState, Role};
use crate::transport::{Transport, TransportEvent};

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum Command {
    Start(Reply),
    Offer(OfferEnvelope, Reply),
    Answer(String, Reply),
    Candidate(String, Reply),
    ChannelReady(Reply),
    Send(String, Reply),
    Disconnect(Reply),
    RemoteBye,
    Abandon { winner: String },
    Expire,
}

#[derive(Clone)]
struct SessionEntry {
    generation: u64,
    role: Role,
    peer_id: Option<String>,
    state: watch::Receiver<HandshakeState>,
    commands: mpsc::Sender<Command>,
}

impl SessionEntry {
    fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    fn is_placeholder(&self) -> bool {
        self.role == Role::Responder
            && self.peer_id.is_none()
            && self.state() == HandshakeState::Idle
    }
}

struct Shared {
    local_id: String,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    table: RwLock<HashMap<String, SessionEntry>>,
    /// Session ids whose offers lost a simultaneous connect, with the instant
    /// the mark lapses. Late traffic for them is dropped instead of creating
    /// placeholders.
    retired: RwLock<HashMap<String, Instant>>,
    signals: mpsc::Sender<RelayMessage>,
    events: mpsc::UnboundedSender<SessionEvent>,
    next_generation: AtomicU64,
}

/// Receiving ends handed out by [`SessionManager::new`].
pub struct SessionChannels {
    /// Relay messages to deliver to the remote peer, in emission order.
    pub signals: mpsc::Receiver<RelayMessage>,
    /// Application notifications.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Handle returned by [`SessionManager::connect`].
pub struct PendingHandshake {
    session_id: String,
    offer: Option<oneshot::Receiver<Result<(), SessionError>>>,
    established: oneshot::Receiver<Result<(), SessionError>>,
}

impl PendingHandshake {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Resolves once the offer has been handed to the relay.
    pub async fn offer_sent(&mut self) -> Result<(), SessionError> {
        match self.offer.take() {
            Some(rx) => rx.await.unwrap_or(Err(SessionError::SessionClosed)),
            None => Ok(()),
        }
    }

    /// Resolves once the channel is open, or with the reason it never will be.
    pub async fn established(mut self) -> Result<(), SessionError> {
        self.offer_sent().await?;
        self.established
            .await
            .unwrap_or(Err(SessionError::SessionClosed))
    }
}

/// Owns every peer session of one local identity.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(
        local_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Self, SessionChannels) {
        let (signals_tx, signals) = mpsc::channel(config.signal_queue.max(1));
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Shared {
            local_id: local_id.into(),
            transport,
            config,
            table: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            signals: signals_tx,
            events: events_tx,
            next_generation: AtomicU64::new(1),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            SessionChannels { signals, events },
        )
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    fn spawn_session(
        &self,
        table: &mut HashMap<String, SessionEntry>,
        session_id: &str,
        role: Role,
        peer_id: Option<String>,
    ) -> (SessionEntry, oneshot::Receiver<Result<(), SessionError>>) {
        let shared = &self.shared;
        let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(HandshakeState::Idle);
        let (commands_tx, commands_rx) = mpsc::channel(shared.config.command_queue.max(1));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = oneshot::channel();

        let outputs = SessionOutputs {
            signals: shared.signals.clone(),
            events: shared.events.clone(),
            transport: Arc::clone(&shared.transport),
            transport_events: transport_tx,
        };
        let mut session = PeerSession::new(
            session_id.to_string(),
            shared.local_id.clone(),
            peer_id.clone(),
            role,
            state_tx,
            outputs,
        );
        session.set_established(established_tx);

        let entry = SessionEntry {
            generation,
            role,
            peer_id,
            state: state_rx,
            commands: commands_tx,
        };
        table.insert(session_id.to_string(), entry.clone());
        debug!("created {} session {}", role, session_id);

        let actor = SessionActor {
            deadline: Instant::now() + shared.config.handshake_timeout,
            session,
            commands: commands_rx,
            transport_events: transport_rx,
            generation,
            shared: Arc::clone(shared),
        };
        tokio::spawn(actor.run());
        (entry, established_rx)
    }

    /// Drop a table entry whose actor has already finished its session, so a
    /// new session can reuse the id before the old actor removes itself.
    fn prune_ended(table: &mut HashMap<String, SessionEntry>, session_id: &str) {
        if table
            .get(session_id)
            .is_some_and(|e| e.state().is_terminal())
        {
            table.remove(session_id);
        }
    }

    async fn is_retired(&self, session_id: &str) -> bool {
        let mut retired = self.shared.retired.write().await;
        let now = Instant::now();
        retired.retain(|_, until| *until > now);
        retired.contains_key(session_id)
    }

    async fn retire(&self, session_id: &str) {
        let until = Instant::now() + self.shared.config.handshake_timeout;
        self.shared
            .retired
            .write()
            .await
            .insert(session_id.to_string(), until);
    }

    /// Whether a live session other than `session_id` already talks to `peer_id`.
    async fn has_live_rival(&self, session_id: &str, peer_id: &str) -> bool {
        self.shared.table.read().await.iter().any(|(sid, e)| {
            sid.as_str() != session_id
                && e.peer_id.as_deref() == Some(peer_id)
                && !e.state().is_terminal()
        })
    }

    async fn entry(&self, session_id: &str) -> Option<SessionEntry> {
        self.shared.table.read().await.get(session_id).cloned()
    }

    async fn request(
        commands: &mpsc::Sender<Command>,
        make: impl FnOnce(Reply) -> Command,
        closed: SessionError,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        if commands.send(make(tx)).await.is_err() {
            return Err(closed);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(closed),
        }
    }

    /// Start a session to `peer_id` as initiator.
    ///
    /// Fails with `AlreadyConnecting` if a live session already uses `session_id`.
    /// A placeholder holding early candidates is discarded instead.
    pub async fn connect(
        &self,
        session_id: &str,
        peer_id: &str,
    ) -> Result<PendingHandshake, SessionError> {
        if !is_valid_session_id(session_id) {
            return Err(SessionError::protocol(format!(
                "invalid session id {session_id:?}"
            )));
        }
        if peer_id == self.shared.local_id {
            return Err(SessionError::protocol("cannot connect to self"));
        }

        self.shared.retired.write().await.remove(session_id);
        let (entry, established, placeholder) = {
            let mut table = self.shared.table.write().await;
            Self::prune_ended(&mut table, session_id);
            let placeholder = match table.get(session_id).map(SessionEntry::is_placeholder) {
                Some(true) => table.remove(session_id).map(|e| e.commands),
                Some(false) => return Err(SessionError::AlreadyConnecting),
                None => None,
            };
            let (entry, established) = self.spawn_session(
                &mut table,
                session_id,
                Role::Initiator,
                Some(peer_id.to_string()),
            );
            (entry, established, placeholder)
        };
        if let Some(placeholder) = placeholder {
            debug!("discarding candidate placeholder for session {}", session_id);
            let _ = placeholder.send(Command::Expire).await;
        }
        info!("connecting to {} on session {}", peer_id, session_id);

        let (tx, rx) = oneshot::channel();
        entry
            .commands
            .send(Command::Start(tx))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        Ok(PendingHandshake {
            session_id: session_id.to_string(),
            offer: Some(rx),
            established,
        })
    }

    /// Handle a remote offer, resolving simultaneous connects.
    ///
    /// When we are already initiating towards the sender, the session with the
    /// lexicographically smaller id keeps the initiator role; on identical ids the
    /// smaller identity does. The losing local session is abandoned silently.
    pub async fn on_offer_received(
        &self,
        session_id: &str,
        payload: &str,
    ) -> Result<(), SessionError> {
        let offer = OfferEnvelope::decode(payload)?;
        if offer.from == self.shared.local_id {
            return Err(SessionError::protocol("offer from own identity"));
        }
        if self.is_retired(session_id).await {
            if self.has_live_rival(session_id, &offer.from).await {
                debug!("ignoring repeated offer for superseded session {}", session_id);
                return Ok(());
            }
            self.shared.retired.write().await.remove(session_id);
        }

        let mut losers = Vec::new();
        let commands = {
            let mut table = self.shared.table.write().await;
            Self::prune_ended(&mut table, session_id);

            let same = table.get(session_id).cloned();
            if let Some(existing) = same.as_ref().filter(|e| e.role == Role::Initiator) {
                let racing = existing.peer_id.as_deref() == Some(offer.from.as_str())
                    && matches!(
                        existing.state(),
                        HandshakeState::Idle | HandshakeState::OfferSent
                    );
                if !racing {
                    return Err(SessionError::protocol(format!(
                        "offer for initiator session in state {}",
                        existing.state()
                    )));
                }
                if self.shared.local_id < offer.from {
                    info!(
                        "simultaneous connect on {}: keeping initiator role",
                        session_id
                    );
                    return Ok(());
                }
                losers.push((session_id.to_string(), existing.commands.clone()));
            }

            let rival = table
                .iter()
                .find(|(sid, e)| {
                    sid.as_str() != session_id
                        && e.role == Role::Initiator
                        && e.peer_id.as_deref() == Some(offer.from.as_str())
                        && matches!(e.state(), HandshakeState::Idle | HandshakeState::OfferSent)
                })
                .map(|(sid, e)| (sid.clone(), e.commands.clone()));
            if let Some((rival_sid, rival_commands)) = rival {
                if rival_sid.as_str() < session_id {
                    info!(
                        "simultaneous connect with {}: keeping {}, ignoring offer for {}",
                        offer.from, rival_sid, session_id
                    );
                    drop(table);
                    self.retire(session_id).await;
                    return Ok(());
                }
                losers.push((rival_sid, rival_commands));
            }

            for (sid, _) in &losers {
                table.remove(sid);
            }

            match table.get_mut(session_id) {
                Some(entry) => {
                    entry.peer_id = Some(offer.from.clone());
                    entry.commands.clone()
                }
                None => {
                    let (entry, _) = self.spawn_session(
                        &mut table,
                        session_id,
                        Role::Responder,
                        Some(offer.from.clone()),
                    );
                    entry.commands
                }
            }
        };

        for (sid, loser) in losers {
            info!(
                "simultaneous connect: session {} yields to {}",
                sid, session_id
            );
            let _ = loser
                .send(Command::Abandon {
                    winner: session_id.to_string(),
                })
                .await;
        }

        Self::request(
            &commands,
            |reply| Command::Offer(offer, reply),
            SessionError::SessionClosed,
        )
        .await
    }

    /// Handle a remote answer. Only valid while our offer is outstanding.
    pub async fn on_answer_received(
        &self,
        session_id: &str,
        payload: &str,
    ) -> Result<(), SessionError> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or(SessionError::UnknownSession)?;
        let answer = payload.to_string();
        Self::request(
            &entry.commands,
            |reply| Command::Answer(answer, reply),
            SessionError::SessionClosed,
        )
        .await
    }

    /// Handle a remote candidate. Candidates for an unknown session create an
    /// idle responder placeholder that holds them until the offer arrives.
    pub async fn on_candidate_received(
        &self,
        session_id: &str,
        candidate: &str,
    ) -> Result<(), SessionError> {
        if !is_valid_session_id(session_id) {
            return Err(SessionError::protocol(format!(
                "invalid session id {session_id:?}"
            )));
        }
        if self.is_retired(session_id).await {
            debug!("dropping candidate for superseded session {}", session_id);
            return Ok(());
        }
        let commands = {
            let mut table = self.shared.table.write().await;
            Self::prune_ended(&mut table, session_id);
            match table.get(session_id) {
                Some(entry) => entry.commands.clone(),
                None => {
                    let (entry, _) =
                        self.spawn_session(&mut table, session_id, Role::Responder, None);
                    entry.commands
                }
            }
        };
        let candidate = candidate.to_string();
        Self::request(
            &commands,
            |reply| Command::Candidate(candidate, reply),
            SessionError::SessionClosed,
        )
        .await
    }

    /// The remote peer is leaving.
    pub async fn on_bye_received(&self, session_id: &str) {
        match self.entry(session_id).await {
            Some(entry) => {
                let _ = entry.commands.send(Command::RemoteBye).await;
            }
            None => debug!("bye for unknown session {}", session_id),
        }
    }

    /// The transport reports the channel open.
    pub async fn on_channel_ready(&self, session_id: &str) -> Result<(), SessionError> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or(SessionError::UnknownSession)?;
        Self::request(
            &entry.commands,
            Command::ChannelReady,
            SessionError::SessionClosed,
        )
        .await
    }

    /// Send a chat message. Only valid while the session is `Open`.
    pub async fn send(&self, session_id: &str, text: &str) -> Result<(), SessionError> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or(SessionError::ChannelNotOpen)?;
        if entry.state() != HandshakeState::Open {
            return Err(SessionError::ChannelNotOpen);
        }
        let text = text.to_string();
        Self::request(
            &entry.commands,
            |reply| Command::Send(text, reply),
            SessionError::ChannelNotOpen,
        )
        .await
    }

    /// Close a session. Idempotent: unknown or already closed sessions are fine.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), SessionError> {
        let Some(entry) = self.entry(session_id).await else {
            return Ok(());
        };
        let _ = Self::request(&entry.commands, Command::Disconnect, SessionError::SessionClosed)
            .await;
        Ok(())
    }

    /// Route one message received from the relay. Errors are logged, never returned.
    pub async fn handle_relay_message(&self, message: RelayMessage) {
        let RelayMessage {
            session_id,
            kind,
            payload,
        } = message;
        let result = match kind {
            MessageKind::Offer => self.on_offer_received(&session_id, &payload).await,
            MessageKind::Answer => self.on_answer_received(&session_id, &payload).await,
            MessageKind::Candidate => self.on_candidate_received(&session_id, &payload).await,
            MessageKind::Bye => {
                self.on_bye_received(&session_id).await;
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(SessionError::UnexpectedAnswer) => {
                debug!("ignoring unexpected answer for session {}", session_id)
            }
            Err(err) => warn!("dropped {} for session {}: {}", kind, session_id, err),
        }
    }

    pub async fn state(&self, session_id: &str) -> Option<HandshakeState> {
        self.entry(session_id).await.map(|e| e.state())
    }

    /// Follow state changes of a live session.
    pub async fn watch_state(&self, session_id: &str) -> Option<watch::Receiver<HandshakeState>> {
        self.entry(session_id).await.map(|e| e.state)
    }

    pub async fn role(&self, session_id: &str) -> Option<Role> {
        self.entry(session_id).await.map(|e| e.role)
    }

    /// Snapshot of every live session.
    pub async fn sessions(&self) -> Vec<(String, HandshakeState)> {
        let table = self.shared.table.read().await;
        let mut sessions: Vec<_> = table
            .iter()
            .map(|(sid, e)| (sid.clone(), e.state()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    /// Disconnect every live session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.shared.table.read().await.keys().cloned().collect();
        for session_id in ids {
            let _ = self.disconnect(&session_id).await;
        }
    }
}

struct SessionActor {
    session: PeerSession,
    commands: mpsc::Receiver<Command>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    deadline: Instant,
    generation: u64,
    shared: Arc<Shared>,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            let handshaking = self.session.state().is_handshaking();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.session
                            .terminate(HandshakeState::Closed, DisconnectReason::LocalClose, true)
                            .await
                    }
                },
                Some(event) = self.transport_events.recv() => {
                    self.handle_transport_event(event).await;
                }
                _ = tokio::time::sleep_until(self.deadline), if handshaking => {
                    if self.session.is_placeholder() {
                        self.session.expire().await;
                    } else {
                        warn!(
                            "handshake for session {} timed out in state {}",
                            self.session.session_id(),
                            self.session.state()
                        );
                        self.session
                            .terminate(HandshakeState::Failed, DisconnectReason::HandshakeTimeout, true)
                            .await;
                    }
                }
            }
            if self.session.state().is_terminal() {
                break;
            }
        }

        // Answer whatever is still queued, then leave the table.
        self.commands.close();
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Disconnect(reply) => {
                    let _ = reply.send(Ok(()));
                }
                Command::Send(_, reply) => {
                    let _ = reply.send(Err(SessionError::ChannelNotOpen));
                }
                Command::Start(reply)
                | Command::Offer(_, reply)
                | Command::Answer(_, reply)
                | Command::Candidate(_, reply)
                | Command::ChannelReady(reply) => {
                    let _ = reply.send(Err(SessionError::SessionClosed));
                }
                Command::RemoteBye | Command::Abandon { .. } | Command::Expire => {}
            }
        }

        let session_id = self.session.session_id().to_string();
        let mut table = self.shared.table.write().await;
        if table
            .get(&session_id)
            .is_some_and(|e| e.generation == self.generation)
        {
            table.remove(&session_id);
        }
        debug!("session {} removed", session_id);
    }

    async fn handle_command(&mut self, command: Command) {
        let session = &mut self.session;
        match command {
            Command::Start(reply) => {
                let _ = reply.send(session.start_offer().await);
            }
            Command::Offer(offer, reply) => {
                let _ = reply.send(session.accept_offer(offer).await);
            }
            Command::Answer(answer, reply) => {
                let _ = reply.send(session.apply_answer(answer).await);
            }
            Command::Candidate(candidate, reply) => {
                let _ = reply.send(session.apply_candidate(candidate).await);
            }
            Command::ChannelReady(reply) => {
                let _ = reply.send(session.channel_ready().await);
            }
            Command::Send(text, reply) => {
                let _ = reply.send(session.send(&text).await);
            }
            Command::Disconnect(reply) => {
                session
                    .terminate(HandshakeState::Closed, DisconnectReason::LocalClose, true)
                    .await;
                let _ = reply.send(Ok(()));
            }
            Command::RemoteBye => {
                session
                    .terminate(HandshakeState::Closed, DisconnectReason::RemoteClosed, false)
                    .await;
            }
            Command::Abandon { winner } => session.abandon(&winner).await,
            Command::Expire => session.expire().await,
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let session = &mut self.session;
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                session.forward_local_candidate(candidate).await
            }
            TransportEvent::ChannelOpen => {
                if let Err(err) = session.channel_ready().await {
                    debug!(
                        "channel open ignored for session {}: {}",
                        session.session_id(),
                        err
                    );
                }
            }
            TransportEvent::ChannelMessage(text) => session.receive(&text),
            TransportEvent::ChannelClosed => session.channel_closed().await,
            TransportEvent::Failed(reason) => {
                session
                    .terminate(
                        HandshakeState::Failed,
                        DisconnectReason::TransportFailure(reason),
                        true,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    fn manager(network: &MemoryNetwork, id: &str) -> (SessionManager, SessionChannels) {
        SessionManager::new(
            id,
            Arc::new(network.transport(id)),
            SessionConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_connect_emits_offer() {
        let network = MemoryNetwork::new();
        let (alice, mut channels) = manager(&network, "alice");
        let mut pending = alice.connect("s1", "bob").await.unwrap();
        pending.offer_sent().await.unwrap();

        let offer = channels.signals.recv().await.unwrap();
        assert_eq!(offer.kind, MessageKind::Offer);
        assert_eq!(offer.session_id, "s1");
        assert_eq!(alice.state("s1").await, Some(HandshakeState::OfferSent));
        assert_eq!(alice.role("s1").await, Some(Role::Initiator));
    }

    #[tokio::test]
    async fn test_second_connect_is_already_connecting() {
        let network = MemoryNetwork::new();
        let (alice, _channels) = manager(&network, "alice");
        let _pending = alice.connect("s1", "bob").await.unwrap();
        assert!(matches!(
            alice.connect("s1", "bob").await,
            Err(SessionError::AlreadyConnecting)
        ));
    }

    #[tokio::test]
    async fn test_answer_for_unknown_session() {
        let network = MemoryNetwork::new();
        let (alice, _channels) = manager(&network, "alice");
        assert_eq!(
            alice.on_answer_received("nope", "sdp").await,
            Err(SessionError::UnknownSession)
        );
    }

    #[tokio::test]
    async fn test_send_before_open_is_channel_not_open() {
        let network = MemoryNetwork::new();
        let (alice, _channels) = manager(&network, "alice");
        assert_eq!(
            alice.send("s1", "hi").await,
            Err(SessionError::ChannelNotOpen)
        );
        let _pending = alice.connect("s1", "bob").await.unwrap();
        assert_eq!(
            alice.send("s1", "hi").await,
            Err(SessionError::ChannelNotOpen)
        );
    }

    #[tokio::test]
    async fn test_malformed_offer_is_protocol_error() {
        let network = MemoryNetwork::new();
        let (bob, _channels) = manager(&network, "bob");
        assert!(matches!(
            bob.on_offer_received("s1", "not json").await,
            Err(SessionError::Protocol(_))
        ));
        assert!(bob.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_candidate_creates_idle_placeholder() {
        let network = MemoryNetwork::new();
        let (bob, _channels) = manager(&network, "bob");
        bob.on_candidate_received("s1", "c1").await.unwrap();
        assert_eq!(bob.state("s1").await, Some(HandshakeState::Idle));
        assert_eq!(bob.role("s1").await, Some(Role::Responder));
    }

    #[tokio::test]
    async fn test_connect_replaces_candidate_placeholder() {
        let network = MemoryNetwork::new();
        let (alice, mut channels) = manager(&network, "alice");
        alice.on_candidate_received("s1", "c1").await.unwrap();
        assert_eq!(alice.role("s1").await, Some(Role::Responder));

        let mut pending = alice.connect("s1", "bob").await.unwrap();
        pending.offer_sent().await.unwrap();
        assert_eq!(alice.role("s1").await, Some(Role::Initiator));
        assert_eq!(alice.state("s1").await, Some(HandshakeState::OfferSent));
        assert!(channels.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_does_not_replace_answered_responder() {
        let network = MemoryNetwork::new();
        let (bob, _channels) = manager(&network, "bob");
        let offer = OfferEnvelope {
            from: "alice".into(),
            description: "offer".into(),
        }
        .encode()
        .unwrap();
        bob.on_offer_received("s1", &offer).await.unwrap();
        assert!(matches!(
            bob.connect("s1", "alice").await,
            Err(SessionError::AlreadyConnecting)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_mark_lapses_after_handshake_timeout() {
        let network = MemoryNetwork::new();
        let (alice, _channels) = manager(&network, "alice");
        alice.retire("b-2").await;
        assert!(alice.is_retired("b-2").await);

        tokio::time::advance(alice.shared.config.handshake_timeout).await;
        assert!(!alice.is_retired("b-2").await);
        assert!(alice.shared.retired.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_ok() {
        let network = MemoryNetwork::new();
        let (alice, _channels) = manager(&network, "alice");
        assert_eq!(alice.disconnect("nope").await, Ok(()));
    }
}
