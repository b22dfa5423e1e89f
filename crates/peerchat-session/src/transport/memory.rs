//! In-process transport.
//!
//! Links opened for the same session id on a shared [`MemoryNetwork`] are paired.
//! Each side trickles one candidate after creating its description. The channel
//! opens once both sides hold both descriptions and have applied at least one
//! remote candidate, which mirrors the order a real ICE exchange completes in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{EventSender, MessageChannel, PeerLink, Transport, TransportError, TransportEvent};
use crate::state::Role;

#[derive(Debug)]
struct Endpoint {
    id: u64,
    owner: String,
    events: EventSender,
    local: Option<String>,
    remote: Option<String>,
    candidates: Vec<String>,
    open: bool,
}

impl Endpoint {
    fn ready(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && !self.candidates.is_empty()
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    sessions: HashMap<String, Vec<Endpoint>>,
    next_id: u64,
}

impl NetworkState {
    fn endpoint_mut(&mut self, session_id: &str, id: u64) -> Option<&mut Endpoint> {
        self.sessions
            .get_mut(session_id)?
            .iter_mut()
            .find(|e| e.id == id)
    }

    fn peer(&self, session_id: &str, id: u64) -> Option<&Endpoint> {
        self.sessions
            .get(session_id)?
            .iter()
            .find(|e| e.id != id)
    }

    fn try_open(&mut self, session_id: &str) {
        let Some(endpoints) = self.sessions.get_mut(session_id) else {
            return;
        };
        if endpoints.len() != 2 || endpoints.iter().any(|e| e.open || !e.ready()) {
            return;
        }
        for endpoint in endpoints.iter_mut() {
            endpoint.open = true;
            let _ = endpoint.events.send(TransportEvent::ChannelOpen);
        }
        debug!("memory channel open for session {}", session_id);
    }
}

/// Shared in-process "network" that pairs memory links by session id.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose links are identified as `owner` on this network.
    pub fn transport(&self, owner: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            owner: owner.into(),
        }
    }

    /// Inject a transport failure into every link of `session_id`.
    pub fn fail(&self, session_id: &str, reason: &str) {
        let state = self.lock();
        if let Some(endpoints) = state.sessions.get(session_id) {
            for endpoint in endpoints {
                let _ = endpoint.events.send(TransportEvent::Failed(reason.to_string()));
            }
        }
    }

    /// Remote candidates applied so far by `owner`'s link for `session_id`.
    pub fn applied_candidates(&self, session_id: &str, owner: &str) -> Vec<String> {
        self.lock()
            .sessions
            .get(session_id)
            .and_then(|endpoints| endpoints.iter().find(|e| e.owner == owner))
            .map(|e| e.candidates.clone())
            .unwrap_or_default()
    }

    /// Number of live links for `session_id`.
    pub fn link_count(&self, session_id: &str) -> usize {
        self.lock()
            .sessions
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// [`Transport`] backed by a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    owner: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(
        &self,
        session_id: &str,
        _role: Role,
        events: EventSender,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        let mut state = self.network.lock();
        state.next_id += 1;
        let id = state.next_id;
        let endpoints = state.sessions.entry(session_id.to_string()).or_default();

        // A newer link from the same owner replaces the old one.
        endpoints.retain(|e| e.owner != self.owner);
        if endpoints.len() >= 2 {
            return Err(TransportError::failed("memory session already has two links"));
        }
        endpoints.push(Endpoint {
            id,
            owner: self.owner.clone(),
            events,
            local: None,
            remote: None,
            candidates: Vec::new(),
            open: false,
        });

        Ok(Box::new(MemoryLink {
            network: self.network.clone(),
            session_id: session_id.to_string(),
            id,
            owner: self.owner.clone(),
            closed: false,
        }))
    }
}

struct MemoryLink {
    network: MemoryNetwork,
    session_id: String,
    id: u64,
    owner: String,
    closed: bool,
}

impl MemoryLink {
    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut Endpoint) -> T,
    ) -> Result<T, TransportError> {
        let mut state = self.network.lock();
        let endpoint = state
            .endpoint_mut(&self.session_id, self.id)
            .ok_or(TransportError::ChannelClosed)?;
        let out = f(endpoint);
        state.try_open(&self.session_id);
        Ok(out)
    }

    fn set_local(&self, description: String) -> Result<String, TransportError> {
        let candidate = format!("memory-candidate:{}:{}", self.owner, self.session_id);
        self.with_endpoint(|e| {
            e.local = Some(description.clone());
            let _ = e.events.send(TransportEvent::LocalCandidate(candidate));
        })?;
        Ok(description)
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn create_offer(&mut self) -> Result<String, TransportError> {
        self.set_local(format!("memory-offer:{}:{}", self.owner, self.session_id))
    }

    async fn create_answer(&mut self, offer: &str) -> Result<String, TransportError> {
        if offer.is_empty() {
            return Err(TransportError::Description("empty offer".into()));
        }
        let offer = offer.to_string();
        self.with_endpoint(|e| e.remote = Some(offer))?;
        self.set_local(format!("memory-answer:{}:{}", self.owner, self.session_id))
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<(), TransportError> {
        if answer.is_empty() {
            return Err(TransportError::Description("empty answer".into()));
        }
        let answer = answer.to_string();
        self.with_endpoint(|e| e.remote = Some(answer))
    }

    async fn add_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        let candidate = candidate.to_string();
        self.with_endpoint(|e| e.candidates.push(candidate))
    }

    async fn open_channel(&mut self) -> Result<Box<dyn MessageChannel>, TransportError> {
        let open = self.with_endpoint(|e| e.open)?;
        if !open {
            return Err(TransportError::ChannelNotReady);
        }
        Ok(Box::new(MemoryChannel {
            network: self.network.clone(),
            session_id: self.session_id.clone(),
            id: self.id,
        }))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.network.lock();
        let Some(endpoints) = state.sessions.get_mut(&self.session_id) else {
            return;
        };
        let was_open = endpoints.iter().any(|e| e.id == self.id && e.open);
        endpoints.retain(|e| e.id != self.id);
        for peer in endpoints.iter_mut() {
            if was_open && peer.open {
                peer.open = false;
                let _ = peer.events.send(TransportEvent::ChannelClosed);
            }
        }
        if endpoints.is_empty() {
            state.sessions.remove(&self.session_id);
        }
    }
}

struct MemoryChannel {
    network: MemoryNetwork,
    session_id: String,
    id: u64,
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let state = self.network.lock();
        let peer = state
            .peer(&self.session_id, self.id)
            .filter(|p| p.open)
            .ok_or(TransportError::ChannelClosed)?;
        peer.events
            .send(TransportEvent::ChannelMessage(text.to_string()))
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {}
}
