//! Web socket protocol driven by a real listener and a hand-rolled client

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use socket_factory::config::{ServerConfig, SessionConfig};
use socket_factory::core::packet::Packet;
use socket_factory::protocol::websocket::{decode_frame, encode_masked_frame, Decoded, OPCODE_CLOSE};
use socket_factory::protocol::{self, WebSocketProtocol};
use socket_factory::server::Server;
use socket_factory::session::{Session, SessionHandler};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

const UPGRADE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
    Host: 127.0.0.1\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

#[derive(Default)]
struct Inbox {
    reads: Mutex<Vec<Packet>>,
    diagnostics: Mutex<Vec<String>>,
}

impl Inbox {
    fn texts(&self) -> Vec<String> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter_map(|packet| match packet {
                Packet::Text(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl SessionHandler for Inbox {
    fn on_read(&self, _session: &Session, packet: Packet) {
        self.reads.lock().unwrap().push(packet);
    }

    fn on_exception_log(&self, source: &str, message: &str) {
        self.diagnostics
            .lock()
            .unwrap()
            .push(format!("{source}: {message}"));
    }
}

fn ws_config() -> SessionConfig {
    SessionConfig {
        tick_interval: Duration::from_millis(50),
        ping_interval: Duration::from_millis(100),
        keepalive_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

async fn start_server(inbox: Arc<Inbox>) -> Server {
    start_server_with(inbox, ws_config()).await
}

async fn start_server_with(inbox: Arc<Inbox>, config: SessionConfig) -> Server {
    let mut server = Server::new(
        ServerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
        },
        inbox,
    )
    .with_session_config(config)
    .with_protocol(protocol::factory::<WebSocketProtocol>());
    server.start().await.unwrap();
    server
}

async fn read_http_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

/// Read frames until a text frame arrives, skipping keepalive pings.
///
/// The server sends text frames as JSON, the way a browser `JSON.parse`s them.
async fn next_text(stream: &mut TcpStream, buf: &mut Vec<u8>) -> String {
    let mut chunk = [0u8; 4096];
    loop {
        match decode_frame(buf).unwrap() {
            Decoded::Packet(Packet::Text(json)) => match serde_json::from_str(&json).unwrap() {
                Packet::Text(text) => return text,
                other => panic!("unexpected packet {other:?}"),
            },
            Decoded::Packet(_) => continue,
            Decoded::Incomplete => {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed the connection");
                buf.extend_from_slice(&chunk[..n]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upgrade_then_exchange_text() {
    let inbox = Arc::new(Inbox::default());
    let mut server = start_server(inbox.clone()).await;
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();

    let head = timeout(Duration::from_secs(5), read_http_head(&mut client))
        .await
        .expect("upgrade response");
    assert!(head.starts_with("HTTP/1.1 101"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    let frame = encode_masked_frame(&Packet::text("hi"), rand::random()).unwrap();
    client.write_all(&frame).await.unwrap();
    wait_until("text on server", || inbox.texts() == vec!["hi".to_string()]).await;

    assert_eq!(server.broadcast(&Packet::text("hello browser")), 1);
    let mut buf = Vec::new();
    let text = timeout(Duration::from_secs(5), next_text(&mut client, &mut buf))
        .await
        .expect("text from server");
    assert_eq!(text, "hello browser");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_and_unknown_opcodes_do_not_reach_handler() {
    let inbox = Arc::new(Inbox::default());
    let mut server = start_server(inbox.clone()).await;
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();
    timeout(Duration::from_secs(5), read_http_head(&mut client))
        .await
        .expect("upgrade response");

    // reserved opcode 0x3, masked, empty
    client.write_all(&[0x83, 0x80, 1, 2, 3, 4]).await.unwrap();
    wait_until("opcode diagnostic", || {
        inbox
            .diagnostics
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains("Opcode not supported: 3"))
    })
    .await;

    client.write_all(&[0x80 | OPCODE_CLOSE, 0x80, 1, 2, 3, 4]).await.unwrap();
    let frame = encode_masked_frame(&Packet::text("still here"), rand::random()).unwrap();
    sleep(Duration::from_millis(200)).await;
    client.write_all(&frame).await.unwrap();

    wait_until("text after close", || inbox.texts() == vec!["still here".to_string()]).await;
    assert_eq!(inbox.reads.lock().unwrap().len(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upgrade_response_does_not_wait_for_a_tick() {
    let slow_ticks = SessionConfig {
        tick_interval: Duration::from_secs(5),
        ping_interval: Duration::from_secs(60),
        keepalive_timeout: Duration::from_secs(120),
        ..SessionConfig::default()
    };
    let inbox = Arc::new(Inbox::default());
    let mut server = start_server_with(inbox, slow_ticks).await;
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    wait_until("server session", || server.session_count() == 1).await;
    sleep(Duration::from_millis(200)).await;
    client.write_all(UPGRADE_REQUEST.as_bytes()).await.unwrap();

    let head = timeout(Duration::from_secs(2), read_http_head(&mut client))
        .await
        .expect("upgrade response before the next tick");
    assert!(head.starts_with("HTTP/1.1 101"));

    server.stop().await;
}
