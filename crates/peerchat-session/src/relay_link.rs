//! WebSocket client side of the relay.
//!
//! A [`RelayLink`] is one participant slot in one relay session. The
//! [`RelayRouter`] owns a link per session id and moves messages between the
//! session manager and the relay in both directions.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use peerchat_common::{Error, MessageKind, RelayMessage, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::manager::SessionManager;

const OUTBOUND_QUEUE: usize = 64;

/// Relay endpoint for `session_id` under `base_url` (`ws://host:port`). The id
/// is percent-encoded as a single path segment.
pub fn session_url(base_url: &str, session_id: &str) -> Result<String> {
    let mut url = Url::parse(base_url)
        .map_err(|e| Error::transport(format!("invalid relay url {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| Error::transport(format!("relay url {base_url} cannot have a path")))?
        .pop_if_empty()
        .extend(["v1", "sessions", session_id]);
    Ok(url.into())
}

/// One joined relay session.
pub struct RelayLink {
    session_id: String,
    outbound: mpsc::Sender<RelayMessage>,
    reader: JoinHandle<()>,
}

impl RelayLink {
    /// Join `session_id` on the relay and feed everything it delivers to `manager`.
    pub async fn connect(base_url: &str, session_id: &str, manager: SessionManager) -> Result<Self> {
        let url = session_url(base_url, session_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::transport(format!("relay join {url} failed: {e}")))?;
        info!("joined relay session {} at {}", session_id, url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<RelayMessage>(OUTBOUND_QUEUE);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode relay message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("failed to send relay message: {}", e);
                    return;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });

        let sid = session_id.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match RelayMessage::decode(&text) {
                        Ok(message) => manager.handle_relay_message(message).await,
                        Err(e) => warn!("invalid frame from relay session {}: {}", sid, e),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        match frame {
                            Some(frame) => warn!(
                                "relay closed session {}: {} ({})",
                                sid, frame.reason, frame.code
                            ),
                            None => debug!("relay closed session {}", sid),
                        }
                        break;
                    }
                    Err(e) => {
                        error!("relay connection for session {} failed: {}", sid, e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            session_id: session_id.to_string(),
            outbound,
            reader,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.outbound.is_closed()
    }

    pub async fn send(&self, message: RelayMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::transport(format!("relay link {} closed", self.session_id)))
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        // The writer drains and closes on its own once `outbound` is dropped.
        self.reader.abort();
    }
}

/// Routes manager output to per-session relay links.
pub struct RelayRouter {
    base_url: String,
    manager: SessionManager,
    links: HashMap<String, RelayLink>,
}

impl RelayRouter {
    pub fn new(base_url: impl Into<String>, manager: SessionManager) -> Self {
        Self {
            base_url: base_url.into(),
            manager,
            links: HashMap::new(),
        }
    }

    /// Join `session_id` ahead of time so offers for it can arrive.
    pub async fn join(&mut self, session_id: &str) -> Result<()> {
        if let Some(link) = self.links.get(session_id) {
            if !link.is_closed() {
                return Ok(());
            }
        }
        let link = RelayLink::connect(&self.base_url, session_id, self.manager.clone()).await?;
        self.links.insert(session_id.to_string(), link);
        Ok(())
    }

    pub async fn route(&mut self, message: RelayMessage) -> Result<()> {
        self.join(&message.session_id).await?;
        let session_id = message.session_id.clone();
        let is_bye = message.kind == MessageKind::Bye;
        let link = self
            .links
            .get(&session_id)
            .ok_or_else(|| Error::not_found(format!("relay link {session_id}")))?;
        link.send(message).await?;
        if is_bye {
            // Leaving frees the relay slot for a future session with this id.
            self.links.remove(&session_id);
        }
        Ok(())
    }

    /// Forward manager signals until the manager's signal queue closes.
    pub async fn run(mut self, mut signals: mpsc::Receiver<RelayMessage>) {
        while let Some(message) = signals.recv().await {
            let kind = message.kind;
            let session_id = message.session_id.clone();
            if let Err(e) = self.route(message).await {
                warn!("failed to route {} for session {}: {}", kind, session_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url() {
        assert_eq!(
            session_url("ws://127.0.0.1:7700/", "s1").unwrap(),
            "ws://127.0.0.1:7700/v1/sessions/s1"
        );
        assert_eq!(
            session_url("wss://relay.example", "a:b").unwrap(),
            "wss://relay.example/v1/sessions/a:b"
        );
        assert_eq!(
            session_url("ws://relay.example/chat", "s1").unwrap(),
            "ws://relay.example/chat/v1/sessions/s1"
        );
    }

    #[test]
    fn test_session_url_encodes_opaque_ids() {
        assert_eq!(
            session_url("ws://127.0.0.1:7700", "room 1/é").unwrap(),
            "ws://127.0.0.1:7700/v1/sessions/room%201%2F%C3%A9"
        );
        assert!(session_url("not a url", "s1").is_err());
    }
}
