use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerchat_common::RelayMessage;
use peerchat_relay::{server, Relay, RelayConfig};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(config: RelayConfig) -> (SocketAddr, Relay) {
    let relay = Relay::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(relay.clone()).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, relay)
}

async fn join(addr: SocketAddr, session_id: &str) -> Client {
    let url = format!("ws://{addr}/v1/sessions/{session_id}");
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, msg: &RelayMessage) {
    ws.send(Message::Text(msg.encode().unwrap())).await.unwrap();
}

async fn recv(ws: &mut Client) -> RelayMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return RelayMessage::decode(&text).unwrap();
        }
    }
}

async fn wait_for_participants(relay: &Relay, expected: usize) {
    for _ in 0..100 {
        if relay.state_counts().await.participants == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never reached {expected} participants");
}

#[tokio::test]
async fn two_participants_exchange_handshake() {
    let (addr, relay) = spawn_relay(RelayConfig::default()).await;
    let mut a = join(addr, "s1").await;
    let mut b = join(addr, "s1").await;
    wait_for_participants(&relay, 2).await;

    let offer = RelayMessage::offer("s1", "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n");
    send(&mut a, &offer).await;
    assert_eq!(recv(&mut b).await, offer);

    let answer = RelayMessage::answer("s1", "v=0 answer");
    send(&mut b, &answer).await;
    assert_eq!(recv(&mut a).await, answer);
}

#[tokio::test]
async fn buffered_messages_reach_late_joiner() {
    let (addr, relay) = spawn_relay(RelayConfig::default()).await;
    let mut a = join(addr, "late").await;
    wait_for_participants(&relay, 1).await;

    send(&mut a, &RelayMessage::offer("late", "o")).await;
    send(&mut a, &RelayMessage::candidate("late", "c1")).await;
    for _ in 0..100 {
        if relay.state_counts().await.buffered == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut b = join(addr, "late").await;
    assert_eq!(recv(&mut b).await.payload, "o");
    assert_eq!(recv(&mut b).await.payload, "c1");
}

#[tokio::test]
async fn third_participant_is_rejected() {
    let (addr, relay) = spawn_relay(RelayConfig::default()).await;
    let _a = join(addr, "full").await;
    let _b = join(addr, "full").await;
    wait_for_participants(&relay, 2).await;

    let url = format!("ws://{addr}/v1/sessions/full");
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn invalid_session_id_is_rejected() {
    let (addr, _relay) = spawn_relay(RelayConfig::default()).await;
    let long = "a".repeat(peerchat_common::protocol::MAX_SESSION_ID_LEN + 1);
    let url = format!("ws://{addr}/v1/sessions/{long}");
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn percent_encoded_session_id_is_decoded() {
    let (addr, relay) = spawn_relay(RelayConfig::default()).await;
    // "room 1/é"
    let mut a = join(addr, "room%201%2F%C3%A9").await;
    let mut b = join(addr, "room%201%2F%C3%A9").await;
    wait_for_participants(&relay, 2).await;
    assert_eq!(relay.session_count().await, 1);

    let offer = RelayMessage::offer("room 1/é", "sdp");
    send(&mut a, &offer).await;
    assert_eq!(recv(&mut b).await, offer);
}

#[tokio::test]
async fn mismatched_session_id_is_dropped() {
    let (addr, relay) = spawn_relay(RelayConfig::default()).await;
    let mut a = join(addr, "s2").await;
    let mut b = join(addr, "s2").await;
    wait_for_participants(&relay, 2).await;

    send(&mut a, &RelayMessage::offer("other", "nope")).await;
    send(&mut a, &RelayMessage::offer("s2", "yes")).await;
    assert_eq!(recv(&mut b).await.payload, "yes");
}

#[tokio::test]
async fn disconnect_frees_slot() {
    let (addr, relay) = spawn_relay(RelayConfig::default()).await;
    let a = join(addr, "s3").await;
    let _b = join(addr, "s3").await;
    wait_for_participants(&relay, 2).await;

    drop(a);
    wait_for_participants(&relay, 1).await;
    let _c = join(addr, "s3").await;
    wait_for_participants(&relay, 2).await;
}

#[tokio::test]
async fn health_reports_sessions() {
    let (addr, relay) = spawn_relay(RelayConfig::default()).await;
    let _a = join(addr, "h1").await;
    wait_for_participants(&relay, 1).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();
    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.contains(r#""waiting_peer":1"#));
}
