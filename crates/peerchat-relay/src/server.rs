//! WebSocket surface of the relay.
//!
//! Each participant opens `GET /v1/sessions/{session_id}` and upgrades to a
//! WebSocket. Every text frame is one [`RelayMessage`]; frames are forwarded to
//! the other participant of the same session.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use peerchat_common::protocol::{is_valid_session_id, MAX_FRAME_BYTES};
use peerchat_common::RelayMessage;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::relay::Relay;
use crate::session::RelayError;

/// Build the relay's HTTP router.
pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions/:session_id", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
    waiting_peer: usize,
    active: usize,
    participants: usize,
    buffered: usize,
}

async fn health(State(relay): State<Relay>) -> Json<HealthResponse> {
    let counts = relay.state_counts().await;
    Json(HealthResponse {
        status: "ok",
        sessions: counts.waiting_peer + counts.active,
        waiting_peer: counts.waiting_peer,
        active: counts.active,
        participants: counts.participants,
        buffered: counts.buffered,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(relay): State<Relay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if !is_valid_session_id(&session_id) {
        return (StatusCode::BAD_REQUEST, "invalid session id").into_response();
    }
    if relay.is_full(&session_id).await {
        return (StatusCode::CONFLICT, "session full").into_response();
    }

    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, relay, session_id, addr))
        .into_response()
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }))
}

async fn handle_socket(stream: WebSocket, relay: Relay, session_id: String, addr: SocketAddr) {
    let (mut sender, mut receiver) = stream.split();

    // The session may have filled up between the upgrade check and now.
    let (participant, mut inbox) = match relay.join(&session_id).await {
        Ok(joined) => joined,
        Err(err) => {
            warn!("{} could not join session {}: {}", addr, session_id, err);
            let code = match err {
                RelayError::SessionFull | RelayError::TooManySessions => close_code::POLICY,
                _ => close_code::ERROR,
            };
            let reason = match err {
                RelayError::SessionFull => "session full",
                RelayError::TooManySessions => "relay at capacity",
                _ => "join failed",
            };
            let _ = sender.send(close_message(code, reason)).await;
            return;
        }
    };
    info!("{} joined session {} as {}", addr, session_id, participant);

    let (tx, mut rx) = mpsc::channel::<Message>(relay.config().outbox_capacity);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || is_close {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let max_per_minute = relay.config().max_messages_per_minute;
    let mut message_window_start = Instant::now();
    let mut message_count: u32 = 0;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            routed = inbox.recv() => {
                let Some(routed) = routed else { break; };
                match routed.encode() {
                    Ok(text) => {
                        if tx.try_send(Message::Text(text)).is_err() {
                            warn!("outbox full for {} in session {}", participant, session_id);
                        }
                    }
                    Err(err) => warn!("failed to encode relay message: {}", err),
                }
            }
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break; };

                let now = Instant::now();
                if now.duration_since(message_window_start) >= Duration::from_secs(60) {
                    message_window_start = now;
                    message_count = 0;
                }
                message_count = message_count.saturating_add(1);
                if message_count > max_per_minute {
                    warn!("rate limit exceeded by {} in session {}", addr, session_id);
                    let _ = tx.send(close_message(close_code::POLICY, "rate limit exceeded")).await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        let _ = tx
                            .send(close_message(close_code::UNSUPPORTED, "binary frames not supported"))
                            .await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let message = match RelayMessage::decode(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("invalid relay message from {}: {}", addr, err);
                        continue;
                    }
                };
                if message.session_id != session_id {
                    warn!(
                        "dropping {} for session {} on connection bound to {}",
                        message.kind, message.session_id, session_id
                    );
                    continue;
                }

                if let Err(err) = relay.send(participant, message).await {
                    debug!("relay send failed for {}: {}", participant, err);
                }
            }
        }
    }

    relay.leave(&session_id, participant).await;
    drop(tx);
    let _ = writer.await;
    info!("{} left session {}", addr, session_id);
}
