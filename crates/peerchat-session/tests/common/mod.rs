#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peerchat_relay::Relay;
use peerchat_session::transport::MemoryNetwork;
use peerchat_session::{SessionConfig, SessionEvent, SessionManager};
use tokio::sync::mpsc;

pub struct Peer {
    pub manager: SessionManager,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// A manager on `network`, joined to `session_ids` on the in-process `relay`.
pub async fn peer(
    relay: &Relay,
    network: &MemoryNetwork,
    id: &str,
    session_ids: &[&str],
    config: SessionConfig,
) -> Peer {
    let (manager, channels) = SessionManager::new(id, Arc::new(network.transport(id)), config);

    let mut participants = HashMap::new();
    for session_id in session_ids {
        let (participant, mut inbox) = relay.join(session_id).await.unwrap();
        participants.insert(session_id.to_string(), participant);
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                manager.handle_relay_message(message).await;
            }
        });
    }

    let relay = relay.clone();
    let mut signals = channels.signals;
    tokio::spawn(async move {
        while let Some(message) = signals.recv().await {
            if let Some(participant) = participants.get(&message.session_id) {
                let _ = relay.send(*participant, message).await;
            }
        }
    });

    Peer {
        manager,
        events: channels.events,
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

/// Wait for `PeerConnected` on `session_id`, returning the reported peer id.
pub async fn wait_connected(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    session_id: &str,
) -> String {
    loop {
        if let SessionEvent::PeerConnected {
            session_id: sid,
            peer_id,
        } = next_event(events).await
        {
            if sid == session_id {
                return peer_id;
            }
        }
    }
}

/// Every event that arrives within `window`.
pub async fn drain_events(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    window: Duration,
) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(window, events.recv()).await {
        out.push(event);
    }
    out
}

pub fn disconnects(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::PeerDisconnected { .. }))
        .count()
}
