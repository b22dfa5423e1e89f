//! Shareable handle over the session pool.

use std::sync::Arc;

use peerchat_common::RelayMessage;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::session::{
    Delivery, Participant, ParticipantId, RelayError, SessionPool, SessionStateCounts,
};

/// In-process signaling relay.
///
/// Cheap to clone; every clone talks to the same set of sessions. The WebSocket
/// server wraps one of these, and tests can drive it directly.
#[derive(Clone)]
pub struct Relay {
    pool: Arc<RwLock<SessionPool>>,
    config: Arc<RelayConfig>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let pool = SessionPool::new(
            config.max_sessions,
            config.buffer_capacity,
            config.idle_timeout,
        );
        Self {
            pool: Arc::new(RwLock::new(pool)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Join `session_id`. The returned receiver yields every message routed to
    /// the new participant, starting with anything buffered before it joined.
    pub async fn join(
        &self,
        session_id: &str,
    ) -> Result<(ParticipantId, mpsc::Receiver<RelayMessage>), RelayError> {
        let (tx, rx) = mpsc::channel(self.config.outbox_capacity);
        let id = Uuid::new_v4();
        let replayed = self
            .pool
            .write()
            .await
            .join(session_id, Participant::new(id, tx))?;
        info!(
            "participant {} joined session {} ({} buffered messages replayed)",
            id, session_id, replayed
        );
        Ok((id, rx))
    }

    /// Route `message` from `from` to the other participant of its session.
    pub async fn send(
        &self,
        from: ParticipantId,
        message: RelayMessage,
    ) -> Result<Delivery, RelayError> {
        let session_id = message.session_id.clone();
        let kind = message.kind;
        let delivery = self.pool.write().await.send(from, message)?;
        match delivery {
            Delivery::Forwarded => debug!("forwarded {} in session {}", kind, session_id),
            Delivery::Buffered => debug!("buffered {} in session {}", kind, session_id),
            Delivery::Dropped => warn!("dropped {} in session {}", kind, session_id),
        }
        Ok(delivery)
    }

    /// Leave a session. Unknown sessions and participants are ignored.
    pub async fn leave(&self, session_id: &str, id: ParticipantId) {
        if self.pool.write().await.leave(session_id, id) {
            info!("participant {} left session {}", id, session_id);
        }
    }

    pub async fn is_full(&self, session_id: &str) -> bool {
        self.pool.read().await.is_full(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.pool.read().await.len()
    }

    pub async fn state_counts(&self) -> SessionStateCounts {
        self.pool.read().await.state_counts()
    }

    /// Discard idle sessions, returning how many were removed.
    pub async fn cleanup(&self) -> usize {
        let removed = self.pool.write().await.cleanup();
        if removed > 0 {
            info!("cleaned up {} idle sessions", removed);
        }
        removed
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
