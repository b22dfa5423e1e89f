#![forbid(unsafe_code)]

//! peerchat-relay - WebSocket signaling relay for two-party chat sessions.
//!
//! The relay:
//! 1. Pairs at most two participants per session id
//! 2. Forwards offer/answer/candidate/bye messages between them
//! 3. Buffers messages for a participant that has not joined yet

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use peerchat_common::helpers::env_bool;
use peerchat_relay::config::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_SESSIONS,
};
use peerchat_relay::{server, Relay, RelayConfig};
use tracing::info;

const CLEANUP_INTERVAL_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "peerchat-relay")]
#[command(about = "peerchat relay - routes session handshake messages between two peers")]
struct Args {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "PEERCHAT_RELAY_LISTEN", default_value = "127.0.0.1:7700")]
    listen: SocketAddr,

    /// Maximum concurrent sessions
    #[arg(long, env = "PEERCHAT_RELAY_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Messages buffered for an absent participant
    #[arg(long, env = "PEERCHAT_RELAY_BUFFER", default_value_t = DEFAULT_BUFFER_CAPACITY)]
    buffer: usize,

    /// Session idle timeout in seconds
    #[arg(long, env = "PEERCHAT_RELAY_IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.listen.ip().is_loopback() && !env_bool("PEERCHAT_RELAY_ALLOW_PUBLIC_BIND", false) {
        return Err(anyhow::anyhow!(
            "refusing non-loopback relay bind without PEERCHAT_RELAY_ALLOW_PUBLIC_BIND=1"
        ));
    }

    peerchat_common::init_tracing_with_default(&format!(
        "{},hyper=warn,tokio=warn,tower_http=info",
        args.log_level
    ));

    info!("Starting peerchat-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig {
        max_sessions: args.max_sessions.max(1),
        buffer_capacity: args.buffer,
        idle_timeout: Duration::from_secs(args.idle_timeout.max(1)),
        ..RelayConfig::from_env()
    };
    info!(
        "max_sessions={} buffer={} idle_timeout={:?}",
        config.max_sessions, config.buffer_capacity, config.idle_timeout
    );
    let relay = Relay::new(config);

    let cleanup_relay = relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            cleanup_relay.cleanup().await;
        }
    });

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Relay listening on {}", args.listen);

    axum::serve(
        listener,
        server::router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down relay");
    })
    .await?;

    Ok(())
}
