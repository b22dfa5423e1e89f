#![forbid(unsafe_code)]

//! Peer sessions for peerchat.
//!
//! A [`SessionManager`] keeps one handshake state machine per remote peer and
//! runs each in its own task. Handshake messages leave through the manager's
//! signal queue and come back through [`SessionManager::handle_relay_message`];
//! [`relay_link::RelayRouter`] wires both directions to a peerchat relay. The
//! peer connection itself sits behind the [`transport::Transport`] trait.

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod message;
pub mod relay_link;
pub mod session;
pub mod state;
pub mod transport;

pub use config::SessionConfig;
pub use error::SessionError;
pub use event::SessionEvent;
pub use manager::{PendingHandshake, SessionChannels, SessionManager};
pub use state::{DisconnectReason, HandshakeState, Role};
