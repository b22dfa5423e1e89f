#![forbid(unsafe_code)]

//! peerchat signaling relay.
//!
//! The relay pairs up exactly two participants per session and forwards
//! handshake messages between them. It never inspects payloads. Messages sent
//! while the other participant is absent are buffered (bounded, oldest dropped
//! first) and replayed once it joins.

pub mod config;
pub mod relay;
pub mod server;
pub mod session;

pub use config::RelayConfig;
pub use relay::Relay;
pub use session::{Delivery, ParticipantId, RelayError, SessionState};
