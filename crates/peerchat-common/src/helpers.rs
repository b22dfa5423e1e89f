//! Environment-driven configuration helpers.

use std::str::FromStr;
use std::time::Duration;

/// Read a boolean flag. `1`, `true`, `yes` and `on` (any case) are true; any other
/// value is false; an unset variable yields `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

/// Read and parse a variable, falling back to `default` when unset or unparsable.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Read a duration in whole seconds, never shorter than `min_secs`.
pub fn env_duration_secs(name: &str, default_secs: u64, min_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name, default_secs).max(min_secs))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
