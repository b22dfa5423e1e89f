use std::time::Duration;

use peerchat_common::helpers::{env_duration_secs, env_parse};

pub const DEFAULT_MAX_SESSIONS: usize = 4096;
pub const DEFAULT_BUFFER_CAPACITY: usize = 16;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
pub const DEFAULT_MAX_MESSAGES_PER_MINUTE: u32 = 600;

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Live sessions allowed at once.
    pub max_sessions: usize,
    /// Messages held for an absent participant before the oldest is dropped.
    pub buffer_capacity: usize,
    /// Sessions without traffic for this long are discarded.
    pub idle_timeout: Duration,
    /// Per-participant outbound queue depth.
    pub outbox_capacity: usize,
    /// Inbound messages accepted per connection per minute.
    pub max_messages_per_minute: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_messages_per_minute: DEFAULT_MAX_MESSAGES_PER_MINUTE,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `PEERCHAT_RELAY_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            max_sessions: env_parse("PEERCHAT_RELAY_MAX_SESSIONS", DEFAULT_MAX_SESSIONS).max(1),
            buffer_capacity: env_parse("PEERCHAT_RELAY_BUFFER", DEFAULT_BUFFER_CAPACITY),
            idle_timeout: env_duration_secs(
                "PEERCHAT_RELAY_IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
                1,
            ),
            ..Self::default()
        }
    }
}
