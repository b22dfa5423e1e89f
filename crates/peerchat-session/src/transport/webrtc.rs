//! WebRTC transport built on webrtc-rs.
//!
//! Descriptions travel as raw SDP; candidates as JSON-encoded
//! `RTCIceCandidateInit`. The initiator creates an ordered data channel labelled
//! `peerchat`; the responder picks it up from `on_data_channel`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{EventSender, MessageChannel, PeerLink, Transport, TransportError, TransportEvent};
use crate::state::Role;

pub const CHANNEL_LABEL: &str = "peerchat";

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// A user-supplied STUN or TURN server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.credential.as_deref().is_some_and(|c| !c.is_empty())
    }

    /// URL with a scheme. Bare `host:port` becomes `turn:` when credentials
    /// are present and `stun:` otherwise.
    pub fn normalized_url(&self) -> String {
        let url = self.url.trim();
        if ["stun:", "stuns:", "turn:", "turns:"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            return url.to_string();
        }
        let scheme = if self.has_credentials() { "turn:" } else { "stun:" };
        format!("{scheme}{url}")
    }

    fn to_ice_server(&self) -> Result<RTCIceServer, TransportError> {
        let url = self.normalized_url();
        if url.starts_with("turn") && !self.has_credentials() {
            return Err(TransportError::failed(format!(
                "TURN server {url} needs a username and credential"
            )));
        }
        Ok(RTCIceServer {
            urls: vec![url],
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
    }
}

/// [`Transport`] creating one `RTCPeerConnection` per session.
pub struct WebRtcTransport {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    /// Use the given servers, or the public STUN defaults when the list is empty.
    pub fn new(servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        let ice_servers = if servers.is_empty() {
            vec![RTCIceServer {
                urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }]
        } else {
            servers
                .iter()
                .map(IceServerConfig::to_ice_server)
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self {
            api: Arc::new(APIBuilder::new().build()),
            ice_servers,
        })
    }
}

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

async fn attach_channel(dc: Arc<RTCDataChannel>, slot: ChannelSlot, events: EventSender) {
    debug!("attaching data channel {}", dc.label());

    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = message_events.send(TransportEvent::ChannelMessage(text));
                }
                Err(e) => warn!("dropping non-utf8 data channel message: {}", e),
            }
        } else {
            debug!("dropping binary data channel message ({} bytes)", msg.data.len());
        }
        Box::pin(async {})
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let _ = close_events.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));

    let already_open = dc.ready_state() == RTCDataChannelState::Open;
    *slot.lock().await = Some(dc);
    if already_open {
        let _ = events.send(TransportEvent::ChannelOpen);
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn open(
        &self,
        session_id: &str,
        role: Role,
        events: EventSender,
    ) -> Result<Box<dyn PeerLink>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(TransportError::failed)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate
                    .to_json()
                    .map_err(|e| e.to_string())
                    .and_then(|init| serde_json::to_string(&init).map_err(|e| e.to_string()))
                {
                    Ok(json) => {
                        let _ = candidate_events.send(TransportEvent::LocalCandidate(json));
                    }
                    Err(e) => warn!("failed to encode local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let state_events = events.clone();
        let sid = session_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("peer connection for session {} is {}", sid, state);
            if state == RTCPeerConnectionState::Failed {
                let _ = state_events.send(TransportEvent::Failed("peer connection failed".into()));
            }
            Box::pin(async {})
        }));

        let slot: ChannelSlot = Arc::new(Mutex::new(None));
        match role {
            Role::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(TransportError::failed)?;
                attach_channel(dc, Arc::clone(&slot), events).await;
            }
            Role::Responder => {
                let slot = Arc::clone(&slot);
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot);
                    let events = events.clone();
                    Box::pin(async move {
                        if dc.label() == CHANNEL_LABEL {
                            attach_channel(dc, slot, events).await;
                        } else {
                            debug!("ignoring data channel {}", dc.label());
                        }
                    })
                }));
            }
        }

        Ok(Box::new(WebRtcLink {
            pc,
            channel: slot,
            closed: false,
        }))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
    closed: bool,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&mut self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(sdp)
    }

    async fn create_answer(&mut self, offer: &str) -> Result<String, TransportError> {
        let remote = RTCSessionDescription::offer(offer.to_string())
            .map_err(|e| TransportError::Description(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;
        Ok(sdp)
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<(), TransportError> {
        let remote = RTCSessionDescription::answer(answer.to_string())
            .map_err(|e| TransportError::Description(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn add_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| TransportError::Candidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn open_channel(&mut self) -> Result<Box<dyn MessageChannel>, TransportError> {
        let dc = self
            .channel
            .lock()
            .await
            .clone()
            .ok_or(TransportError::ChannelNotReady)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelNotReady);
        }
        Ok(Box::new(WebRtcChannel { dc }))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.channel.lock().await.take();
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection: {}", e);
        }
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl MessageChannel for WebRtcChannel {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("error closing data channel: {}", e);
        }
    }
}
