use std::time::Duration;

use peerchat_common::helpers::{env_duration_secs, env_parse};

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SIGNAL_QUEUE: usize = 64;
pub const DEFAULT_COMMAND_QUEUE: usize = 32;

/// Session manager settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session may stay short of `Open` before it fails.
    pub handshake_timeout: Duration,
    /// Depth of the outbound relay message queue.
    pub signal_queue: usize,
    /// Depth of each session's command queue.
    pub command_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            signal_queue: DEFAULT_SIGNAL_QUEUE,
            command_queue: DEFAULT_COMMAND_QUEUE,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `PEERCHAT_HANDSHAKE_TIMEOUT_SECS` and `PEERCHAT_SIGNAL_QUEUE`.
    pub fn from_env() -> Self {
        Self {
            handshake_timeout: env_duration_secs(
                "PEERCHAT_HANDSHAKE_TIMEOUT_SECS",
                DEFAULT_HANDSHAKE_TIMEOUT_SECS,
                1,
            ),
            signal_queue: env_parse("PEERCHAT_SIGNAL_QUEUE", DEFAULT_SIGNAL_QUEUE).max(1),
            ..Self::default()
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
