//! End-to-end tests over real TCP connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use geochat::protocol::{Message, Position};
use geochat::server::{Server, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, msg: &Message) {
        let frame = msg.encode().unwrap();
        self.send_raw(std::str::from_utf8(&frame).unwrap()).await;
    }

    async fn next_line(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("timed out waiting for server")
            .unwrap_or(None)
    }
}

/// Helper: start the server on a random port and return it with its address.
async fn start_test_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = Arc::new(Server::new(config));
    tokio::spawn(srv.clone().serve(listener));
    (srv, addr)
}

async fn wait_for_members(srv: &Server, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while srv.hub().members().await.unwrap().len() != n {
        assert!(Instant::now() < deadline, "expected {n} registered clients");
        sleep(Duration::from_millis(10)).await;
    }
}

fn sample(text: &str) -> Message {
    Message::new("a@x", "a", text, Position::new(-122.42, 37.77, 15.0, 90.0))
}

#[tokio::test]
async fn message_is_fanned_out_to_everyone_including_sender() {
    let (srv, addr) = start_test_server(ServerConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    let mut c = TestClient::connect(addr).await;
    wait_for_members(&srv, 3).await;

    a.send(&sample("hello")).await;

    let expected = String::from_utf8(sample("hello").encode().unwrap().to_vec()).unwrap();
    for client in [&mut a, &mut b, &mut c] {
        assert_eq!(client.next_line().await.as_deref(), Some(expected.as_str()));
    }
}

#[tokio::test]
async fn malformed_frame_is_skipped_without_disconnect() {
    let (srv, addr) = start_test_server(ServerConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    wait_for_members(&srv, 1).await;

    a.send_raw("this is not json").await;
    a.send_raw("").await;
    a.send(&sample("still here")).await;

    let line = a.next_line().await.unwrap();
    assert_eq!(Message::decode(line.as_bytes()).unwrap(), sample("still here"));
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let config = ServerConfig {
        max_frame_len: 64,
        ..ServerConfig::default()
    };
    let (srv, addr) = start_test_server(config).await;
    let mut a = TestClient::connect(addr).await;
    wait_for_members(&srv, 1).await;

    a.send_raw(&"x".repeat(500)).await;

    assert_eq!(a.next_line().await, None);
    wait_for_members(&srv, 0).await;
}

#[tokio::test]
async fn disconnect_unregisters_client() {
    let (srv, addr) = start_test_server(ServerConfig::default()).await;
    let a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    wait_for_members(&srv, 2).await;

    drop(a);
    wait_for_members(&srv, 1).await;

    b.send(&sample("anyone?")).await;
    assert!(b.next_line().await.is_some());
}

#[tokio::test]
async fn half_closed_peer_still_gets_queued_frames() {
    let (srv, addr) = start_test_server(ServerConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    wait_for_members(&srv, 1).await;

    a.send(&sample("last words")).await;
    a.writer.shutdown().await.unwrap();

    let line = a.next_line().await.expect("queued frame was dropped");
    assert_eq!(Message::decode(line.as_bytes()).unwrap(), sample("last words"));
    assert_eq!(a.next_line().await, None);
    wait_for_members(&srv, 0).await;
}

#[tokio::test]
async fn wire_output_uses_shortest_numbers_and_escapes() {
    let (srv, addr) = start_test_server(ServerConfig::default()).await;
    let mut a = TestClient::connect(addr).await;
    wait_for_members(&srv, 1).await;

    a.send_raw(r#"{"email":"a@x","username":"a","message":"<b> & co","position":{"lat":1.0,"lon":-2.5,"alt":0,"heading":90.0}}"#)
        .await;

    assert_eq!(
        a.next_line().await.as_deref(),
        Some(r#"{"email":"a@x","username":"a","message":"\u003cb\u003e \u0026 co","position":{"lat":1,"lon":-2.5,"alt":0,"heading":90}}"#)
    );
}
