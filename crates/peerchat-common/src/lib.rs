//! Shared utilities for peerchat: relay wire protocol, configuration, logging, error types.
//!
//! Both the relay service and the session manager depend on this crate so that the
//! two ends of a signaling exchange agree on one wire format.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::{MessageKind, RelayMessage};

/// Initialize tracing with a specific default level.
///
/// `RUST_LOG` still wins when it is set. Calling this more than once is harmless;
/// only the first subscriber is installed.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
