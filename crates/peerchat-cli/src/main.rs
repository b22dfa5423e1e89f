//! peerchat CLI: terminal chat over a peerchat relay, plus a self-contained demo.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use peerchat_relay::{server, Relay};
use peerchat_session::relay_link::RelayRouter;
use peerchat_session::transport::{MemoryNetwork, Transport};
use peerchat_session::{SessionChannels, SessionConfig, SessionEvent, SessionManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

const EVENT_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "peerchat")]
#[command(about = "peerchat - peer-to-peer text chat")]
struct Args {
    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat with one peer through a relay
    Chat(ChatArgs),

    /// Run a relay and two in-process peers and let them talk
    Demo,

    /// Show version information
    Version,
}

#[derive(ClapArgs, Debug)]
struct ChatArgs {
    /// Relay base URL
    #[arg(long, env = "PEERCHAT_RELAY_URL", default_value = "ws://127.0.0.1:7700")]
    relay: String,

    /// Session id shared with the peer
    #[arg(short, long)]
    session: String,

    /// Our identity
    #[arg(short, long, env = "PEERCHAT_NAME")]
    name: Option<String>,

    /// The peer's identity
    #[arg(short, long)]
    peer: String,

    /// Send the offer instead of waiting for one
    #[arg(long)]
    initiate: bool,

    /// STUN/TURN server; repeatable. Defaults to public STUN servers.
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// TURN username
    #[arg(long, env = "PEERCHAT_TURN_USERNAME")]
    ice_username: Option<String>,

    /// TURN credential
    #[arg(long, env = "PEERCHAT_TURN_CREDENTIAL")]
    ice_credential: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    peerchat_common::init_tracing_with_default(&args.log_level);

    match args.command {
        Command::Chat(opts) => chat(opts).await,
        Command::Demo => demo().await,
        Command::Version => {
            println!("peerchat {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[cfg(feature = "webrtc")]
fn build_transport(opts: &ChatArgs) -> Result<Arc<dyn Transport>> {
    use peerchat_session::transport::{IceServerConfig, WebRtcTransport};

    let servers: Vec<IceServerConfig> = opts
        .ice_servers
        .iter()
        .map(|url| match (&opts.ice_username, &opts.ice_credential) {
            (Some(user), Some(credential)) if !url.starts_with("stun") => {
                IceServerConfig::turn(url, user, credential)
            }
            _ => IceServerConfig::stun(url),
        })
        .collect();
    let transport = WebRtcTransport::new(&servers).context("failed to set up WebRTC")?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "webrtc"))]
fn build_transport(_opts: &ChatArgs) -> Result<Arc<dyn Transport>> {
    anyhow::bail!("peerchat was built without the webrtc feature; only `demo` is available")
}

async fn chat(opts: ChatArgs) -> Result<()> {
    let name = opts
        .name
        .clone()
        .unwrap_or_else(|| format!("peer-{:04x}", rand::random::<u16>()));
    let transport = build_transport(&opts)?;

    let (manager, SessionChannels { signals, mut events }) =
        SessionManager::new(name.clone(), transport, SessionConfig::from_env());
    let mut router = RelayRouter::new(opts.relay.clone(), manager.clone());
    router
        .join(&opts.session)
        .await
        .with_context(|| format!("failed to join session {} at {}", opts.session, opts.relay))?;
    tokio::spawn(router.run(signals));

    println!("{} on session {} (type /quit to leave)", name, opts.session);
    if opts.initiate {
        let pending = manager.connect(&opts.session, &opts.peer).await?;
        let session_id = opts.session.clone();
        tokio::spawn(async move {
            if let Err(e) = pending.established().await {
                warn!("session {} was not established: {}", session_id, e);
            }
        });
        println!("calling {}...", opts.peer);
    } else {
        println!("waiting for {}...", opts.peer);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Err(e) = manager.send(&opts.session, line).await {
                    println!("! not sent: {}", e);
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, &opts.peer);
                if matches!(event, SessionEvent::PeerDisconnected { .. }) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.shutdown().await;
    // Give the relay link a moment to flush the bye.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

fn print_event(event: &SessionEvent, peer: &str) {
    match event {
        SessionEvent::PeerConnected {
            session_id,
            peer_id,
        } => println!("* connected to {} on {}", peer_id, session_id),
        SessionEvent::PeerDisconnected { session_id, reason } => {
            println!("* session {} ended: {}", session_id, reason)
        }
        SessionEvent::MessageReceived {
            text,
            timestamp,
            sender,
            ..
        } => println!(
            "[{}] {}: {}",
            timestamp.format("%H:%M:%S"),
            sender.as_deref().unwrap_or(peer),
            text
        ),
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Result<SessionEvent> {
    tokio::time::timeout(EVENT_WAIT, events.recv())
        .await
        .context("timed out waiting for a session event")?
        .context("session event stream ended")
}

async fn demo_peer(
    base_url: &str,
    network: &MemoryNetwork,
    id: &str,
    join: Option<&str>,
) -> Result<(SessionManager, mpsc::UnboundedReceiver<SessionEvent>)> {
    let (manager, SessionChannels { signals, events }) = SessionManager::new(
        id,
        Arc::new(network.transport(id)),
        SessionConfig::default(),
    );
    let mut router = RelayRouter::new(base_url, manager.clone());
    if let Some(session_id) = join {
        router.join(session_id).await?;
    }
    tokio::spawn(router.run(signals));
    Ok((manager, events))
}

async fn demo() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = server::router(Relay::default()).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("demo relay stopped: {}", e);
        }
    });
    let base_url = format!("ws://{addr}");
    println!("relay listening on {}", base_url);

    let network = MemoryNetwork::new();
    let session_id = format!("demo-{:08x}", rand::random::<u32>());
    let (bob, mut bob_events) = demo_peer(&base_url, &network, "bob", Some(&session_id)).await?;
    let (alice, mut alice_events) = demo_peer(&base_url, &network, "alice", None).await?;

    alice
        .connect(&session_id, "bob")
        .await?
        .established()
        .await?;
    print_event(&next_event(&mut alice_events).await?, "bob");
    print_event(&next_event(&mut bob_events).await?, "alice");

    alice.send(&session_id, "hello bob").await?;
    print_event(&next_event(&mut bob_events).await?, "alice");
    bob.send(&session_id, "hi alice").await?;
    print_event(&next_event(&mut alice_events).await?, "bob");

    alice.disconnect(&session_id).await?;
    print_event(&next_event(&mut alice_events).await?, "bob");
    print_event(&next_event(&mut bob_events).await?, "alice");
    Ok(())
}
