//! Relay session bookkeeping.
//!
//! A relay session is a rendezvous point for exactly two participants:
//! - WAITING_PEER: one participant joined, messages for the absent one are buffered
//! - ACTIVE: both participants joined, messages are forwarded directly
//!
//! A session with no participants left is discarded together with its buffer.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use peerchat_common::RelayMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque handle identifying one joined participant.
pub type ParticipantId = Uuid;

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// One participant joined, waiting for the other
    WaitingPeer,
    /// Both participants joined, forwarding enabled
    Active,
}

/// What happened to a message handed to [`RelaySession::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the other participant's outbox.
    Forwarded,
    /// Other participant absent; held until it joins.
    Buffered,
    /// Other participant's outbox was full or gone.
    Dropped,
}

/// One joined participant.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    /// Messages destined for this participant.
    pub outbox: mpsc::Sender<RelayMessage>,
    pub joined_at: Instant,
}

impl Participant {
    pub fn new(id: ParticipantId, outbox: mpsc::Sender<RelayMessage>) -> Self {
        Self {
            id,
            outbox,
            joined_at: Instant::now(),
        }
    }

    fn deliver(&self, message: RelayMessage) -> bool {
        match self.outbox.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to queue relay message for participant {}: {}", self.id, e);
                false
            }
        }
    }
}

/// A relay session between two participants
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub state: SessionState,
    slots: [Option<Participant>; 2],
    /// Messages waiting for the absent participant, oldest first.
    buffered: VecDeque<RelayMessage>,
    buffer_capacity: usize,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub messages_forwarded: u64,
    pub messages_dropped: u64,
}

impl RelaySession {
    /// Create a new, empty session
    pub fn new(session_id: impl Into<String>, buffer_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            session_id: session_id.into(),
            state: SessionState::WaitingPeer,
            slots: [None, None],
            buffered: VecDeque::with_capacity(buffer_capacity),
            buffer_capacity,
            created_at: now,
            last_activity: now,
            messages_forwarded: 0,
            messages_dropped: 0,
        }
    }

    /// Register a participant and hand it everything buffered for it.
    ///
    /// Returns the number of buffered messages delivered.
    pub fn register(&mut self, participant: Participant) -> Result<usize, RelayError> {
        if self.slots.iter().flatten().any(|p| p.id == participant.id) {
            return Err(RelayError::AlreadyJoined);
        }
        let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) else {
            return Err(RelayError::SessionFull);
        };
        let newcomer = participant.id;
        *slot = Some(participant);
        self.update_state();
        self.last_activity = Instant::now();

        if self.state != SessionState::Active {
            return Ok(0);
        }

        // Only the other participant could have filled the buffer.
        let mut delivered = 0;
        let pending: Vec<RelayMessage> = self.buffered.drain(..).collect();
        if let Some(receiver) = self.slots.iter().flatten().find(|p| p.id == newcomer) {
            for message in pending {
                if receiver.deliver(message) {
                    delivered += 1;
                    self.messages_forwarded += 1;
                } else {
                    self.messages_dropped += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// Route a message from `from` to the other participant, buffering if absent.
    pub fn forward(
        &mut self,
        from: ParticipantId,
        message: RelayMessage,
    ) -> Result<Delivery, RelayError> {
        if !self.has_participant(from) {
            return Err(RelayError::UnknownParticipant);
        }
        self.last_activity = Instant::now();

        if let Some(dest) = self.slots.iter().flatten().find(|p| p.id != from) {
            if dest.deliver(message) {
                self.messages_forwarded += 1;
                return Ok(Delivery::Forwarded);
            }
            self.messages_dropped += 1;
            return Ok(Delivery::Dropped);
        }

        if self.buffered.len() >= self.buffer_capacity {
            if let Some(oldest) = self.buffered.pop_front() {
                debug!(
                    "buffer full for session {}, dropping oldest {} message",
                    self.session_id, oldest.kind
                );
                self.messages_dropped += 1;
            }
        }
        if self.buffer_capacity > 0 {
            self.buffered.push_back(message);
        }
        Ok(Delivery::Buffered)
    }

    /// Remove a participant. Returns false if it was not joined.
    pub fn remove(&mut self, id: ParticipantId) -> bool {
        let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|p| p.id == id))
        else {
            return false;
        };
        *slot = None;
        self.update_state();
        self.last_activity = Instant::now();
        true
    }

    pub fn has_participant(&self, id: ParticipantId) -> bool {
        self.slots.iter().flatten().any(|p| p.id == id)
    }

    pub fn participant_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_full(&self) -> bool {
        self.participant_count() == self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participant_count() == 0
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Forget participants whose outbox receiver has been dropped.
    pub fn prune_disconnected(&mut self) -> usize {
        let mut pruned = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|p| p.outbox.is_closed()) {
                *slot = None;
                pruned += 1;
            }
        }
        if pruned > 0 {
            self.update_state();
        }
        pruned
    }

    /// Drop every buffered message, returning how many were dropped.
    pub fn expire_buffer(&mut self) -> usize {
        let expired = self.buffered.len();
        self.buffered.clear();
        self.messages_dropped += expired as u64;
        expired
    }

    fn update_state(&mut self) {
        self.state = if self.is_full() {
            SessionState::Active
        } else {
            SessionState::WaitingPeer
        };
    }
}

/// Relay errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("session full")]
    SessionFull,
    #[error("relay at session capacity")]
    TooManySessions,
    #[error("session not found")]
    SessionNotFound,
    #[error("unknown participant")]
    UnknownParticipant,
    #[error("participant already joined")]
    AlreadyJoined,
}

/// Session pool managing all live sessions
#[derive(Debug)]
pub struct SessionPool {
    sessions: HashMap<String, RelaySession>,
    max_sessions: usize,
    buffer_capacity: usize,
    session_idle_timeout: Duration,
}

impl SessionPool {
    /// Create a new session pool
    pub fn new(max_sessions: usize, buffer_capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
            buffer_capacity,
            session_idle_timeout: idle_timeout,
        }
    }

    /// Register `participant` under `session_id`, creating the session if needed.
    pub fn join(
        &mut self,
        session_id: &str,
        participant: Participant,
    ) -> Result<usize, RelayError> {
        if !self.sessions.contains_key(session_id) {
            if self.sessions.len() >= self.max_sessions {
                return Err(RelayError::TooManySessions);
            }
            let session = RelaySession::new(session_id, self.buffer_capacity);
            self.sessions.insert(session_id.to_string(), session);
        }
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(RelayError::SessionNotFound)?;
        session.register(participant)
    }

    /// Relay `message` from `from` within its session.
    pub fn send(
        &mut self,
        from: ParticipantId,
        message: RelayMessage,
    ) -> Result<Delivery, RelayError> {
        let session = self
            .sessions
            .get_mut(&message.session_id)
            .ok_or(RelayError::SessionNotFound)?;
        session.forward(from, message)
    }

    /// Remove a participant; the session goes away once nobody is left.
    pub fn leave(&mut self, session_id: &str, id: ParticipantId) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let removed = session.remove(id);
        if session.is_empty() {
            self.sessions.remove(session_id);
        }
        removed
    }

    /// Whether a join for `session_id` would be rejected as full.
    pub fn is_full(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(RelaySession::is_full)
            .unwrap_or(false)
    }

    /// Get an existing session
    pub fn get(&self, session_id: &str) -> Option<&RelaySession> {
        self.sessions.get(session_id)
    }

    /// Sweep the pool: forget participants whose connection is gone, expire
    /// buffers nobody collected within the idle timeout, and discard sessions
    /// left without participants. Returns the number of sessions discarded.
    pub fn cleanup(&mut self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.session_idle_timeout;
        let before = self.sessions.len();

        for session in self.sessions.values_mut() {
            session.prune_disconnected();
            if now.duration_since(session.last_activity) > idle_timeout {
                let expired = session.expire_buffer();
                if expired > 0 {
                    debug!(
                        "expired {} buffered messages in idle session {}",
                        expired, session.session_id
                    );
                }
            }
        }
        self.sessions.retain(|_, session| !session.is_empty());

        before - self.sessions.len()
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Get counts by state
    pub fn state_counts(&self) -> SessionStateCounts {
        let mut counts = SessionStateCounts::default();
        for session in self.sessions.values() {
            match session.state {
                SessionState::WaitingPeer => counts.waiting_peer += 1,
                SessionState::Active => counts.active += 1,
            }
            counts.participants += session.participant_count();
            counts.buffered += session.buffered_len();
        }
        counts
    }
}

/// Session state counts for health reporting
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SessionStateCounts {
    pub waiting_peer: usize,
    pub active: usize,
    pub participants: usize,
    pub buffered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(capacity: usize) -> (Participant, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Participant::new(Uuid::new_v4(), tx), rx)
    }

    #[test]
    fn test_session_lifecycle() {
        let mut session = RelaySession::new("s1", 16);
        assert_eq!(session.state, SessionState::WaitingPeer);

        let (a, _a_rx) = participant(8);
        session.register(a).unwrap();
        assert_eq!(session.state, SessionState::WaitingPeer);

        let (b, _b_rx) = participant(8);
        let b_id = b.id;
        session.register(b).unwrap();
        assert_eq!(session.state, SessionState::Active);

        assert!(session.remove(b_id));
        assert_eq!(session.state, SessionState::WaitingPeer);
        assert!(!session.remove(b_id));
    }

    #[test]
    fn test_third_participant_rejected() {
        let mut session = RelaySession::new("s1", 16);
        let (a, _a_rx) = participant(8);
        let (b, _b_rx) = participant(8);
        let (c, _c_rx) = participant(8);
        session.register(a).unwrap();
        session.register(b).unwrap();
        assert_eq!(session.register(c), Err(RelayError::SessionFull));
    }

    #[test]
    fn test_forward_between_participants() {
        let mut session = RelaySession::new("s1", 16);
        let (a, mut a_rx) = participant(8);
        let (b, mut b_rx) = participant(8);
        let (a_id, b_id) = (a.id, b.id);
        session.register(a).unwrap();
        session.register(b).unwrap();

        let offer = RelayMessage::offer("s1", "sdp-a");
        assert_eq!(session.forward(a_id, offer.clone()), Ok(Delivery::Forwarded));
        assert_eq!(b_rx.try_recv().unwrap(), offer);
        assert!(a_rx.try_recv().is_err());

        let answer = RelayMessage::answer("s1", "sdp-b");
        assert_eq!(session.forward(b_id, answer.clone()), Ok(Delivery::Forwarded));
        assert_eq!(a_rx.try_recv().unwrap(), answer);
        assert_eq!(session.messages_forwarded, 2);
    }

    #[test]
    fn test_buffer_replayed_once_on_join() {
        let mut session = RelaySession::new("s1", 16);
        let (a, _a_rx) = participant(8);
        let a_id = a.id;
        session.register(a).unwrap();

        for i in 0..3 {
            let msg = RelayMessage::candidate("s1", format!("c{i}"));
            assert_eq!(session.forward(a_id, msg), Ok(Delivery::Buffered));
        }
        assert_eq!(session.buffered_len(), 3);

        let (b, mut b_rx) = participant(8);
        assert_eq!(session.register(b), Ok(3));
        assert_eq!(session.buffered_len(), 0);

        for i in 0..3 {
            assert_eq!(b_rx.try_recv().unwrap().payload, format!("c{i}"));
        }
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let mut session = RelaySession::new("s1", 2);
        let (a, _a_rx) = participant(8);
        let a_id = a.id;
        session.register(a).unwrap();

        for i in 0..4 {
            session
                .forward(a_id, RelayMessage::candidate("s1", format!("c{i}")))
                .unwrap();
        }
        assert_eq!(session.buffered_len(), 2);
        assert_eq!(session.messages_dropped, 2);

        let (b, mut b_rx) = participant(8);
        session.register(b).unwrap();
        assert_eq!(b_rx.try_recv().unwrap().payload, "c2");
        assert_eq!(b_rx.try_recv().unwrap().payload, "c3");
    }

    #[test]
    fn test_forward_from_stranger_rejected() {
        let mut session = RelaySession::new("s1", 16);
        let (a, _a_rx) = participant(8);
        session.register(a).unwrap();
        let result = session.forward(Uuid::new_v4(), RelayMessage::bye("s1"));
        assert_eq!(result, Err(RelayError::UnknownParticipant));
    }

    #[test]
    fn test_full_outbox_counts_drop() {
        let mut session = RelaySession::new("s1", 16);
        let (a, _a_rx) = participant(8);
        let (b, _b_rx) = participant(1);
        let a_id = a.id;
        session.register(a).unwrap();
        session.register(b).unwrap();

        assert_eq!(
            session.forward(a_id, RelayMessage::candidate("s1", "1")),
            Ok(Delivery::Forwarded)
        );
        assert_eq!(
            session.forward(a_id, RelayMessage::candidate("s1", "2")),
            Ok(Delivery::Dropped)
        );
        assert_eq!(session.messages_dropped, 1);
    }

    #[test]
    fn test_pool_discards_empty_sessions() {
        let mut pool = SessionPool::new(10, 16, Duration::from_secs(60));
        let (a, _a_rx) = participant(8);
        let a_id = a.id;
        pool.join("s1", a).unwrap();
        pool.send(a_id, RelayMessage::offer("s1", "o")).unwrap();
        assert_eq!(pool.state_counts().buffered, 1);

        assert!(pool.leave("s1", a_id));
        assert!(pool.is_empty());

        // A fresh join starts from an empty buffer.
        let (b, mut b_rx) = participant(8);
        let (c, _c_rx) = participant(8);
        pool.join("s1", b).unwrap();
        assert_eq!(pool.join("s1", c), Ok(0));
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn test_pool_max_limit() {
        let mut pool = SessionPool::new(2, 16, Duration::from_secs(60));
        pool.join("a", participant(1).0).unwrap();
        pool.join("b", participant(1).0).unwrap();

        let result = pool.join("c", participant(1).0);
        assert_eq!(result, Err(RelayError::TooManySessions));

        // Joining an existing session is still fine.
        assert!(pool.join("a", participant(1).0).is_ok());
        assert!(pool.is_full("a"));
        assert!(!pool.is_full("b"));
    }

    #[test]
    fn test_pool_send_unknown_session() {
        let mut pool = SessionPool::new(2, 16, Duration::from_secs(60));
        let result = pool.send(Uuid::new_v4(), RelayMessage::bye("nope"));
        assert_eq!(result, Err(RelayError::SessionNotFound));
    }

    #[test]
    fn test_pool_cleanup_discards_abandoned_sessions() {
        let mut pool = SessionPool::new(10, 16, Duration::from_secs(60));
        // The receiver is dropped right away, as when a socket task dies.
        pool.join("s1", participant(1).0).unwrap();
        assert_eq!(pool.cleanup(), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_cleanup_expires_idle_buffer_only() {
        let mut pool = SessionPool::new(10, 16, Duration::ZERO);
        let (a, _a_rx) = participant(8);
        let a_id = a.id;
        pool.join("s1", a).unwrap();
        pool.send(a_id, RelayMessage::offer("s1", "o")).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(pool.cleanup(), 0);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.state_counts().buffered, 0);
        assert_eq!(pool.get("s1").unwrap().messages_dropped, 1);
    }
}
