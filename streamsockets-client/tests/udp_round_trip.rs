//! End-to-end datagram round-trip through the client's engine and carrier
//! against a minimal fake server, standing in for scenario E1/E5 (§8):
//! a local UDP sender gets back the bytes the remote side echoed, demuxed
//! to the same tunnel id the fake server granted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use streamsockets_client::config::Config;
use streamsockets_client::engine::Engine;
use streamsockets_client::udp as client_udp;

/// A minimal stand-in for the server: grants tunnel 1 immediately (new
/// protocol handshake completion implies authentication, §4.6), grants
/// tunnel 2 on `NEW`, and otherwise just echoes binary frames back
/// untouched (the real server would strip/re-add the tunnel id on its way
/// to and from the UDP backend; since the id is preserved end to end this
/// is an equivalent stand-in for the client's purposes).
async fn run_fake_session(mut socket: WebSocket) {
    if socket
        .send(AxumMessage::Text("SOCKET ID: 1".into()))
        .await
        .is_err()
    {
        return;
    }
    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            AxumMessage::Binary(data) => {
                if socket.send(AxumMessage::Binary(data)).await.is_err() {
                    break;
                }
            }
            AxumMessage::Text(text) if text == "NEW" => {
                if socket
                    .send(AxumMessage::Text("SOCKET ID: 2".into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            AxumMessage::Ping(payload) => {
                let _ = socket.send(AxumMessage::Pong(payload)).await;
            }
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(run_fake_session)
}

async fn spawn_fake_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/tunnel", get(handle_upgrade));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn test_config(server_addr: SocketAddr) -> Arc<Config> {
    Arc::new(Config::parse_from([
        "streamsockets-client",
        "--auth-token",
        "secret",
        "--route",
        "10.0.0.1:5060",
        "--websocket-uri",
        &format!("ws://{server_addr}/tunnel"),
        "--bind-port",
        "0",
    ]))
}

async fn spawn_client(server_addr: SocketAddr) -> SocketAddr {
    let config = test_config(server_addr);
    let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port)
        .parse()
        .unwrap();
    let sockets = client_udp::bind_listeners(bind_addr, config.udp_listeners).unwrap();
    let local_socket = Arc::clone(&sockets[0]);
    let client_listen_addr = local_socket.local_addr().unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = Engine::new(config, local_socket, shutdown_rx);
    client_udp::spawn_listeners(sockets, engine.inbox_sender());
    tokio::spawn(engine.run());

    client_listen_addr
}

#[tokio::test]
async fn local_udp_sender_gets_its_own_echo_back() {
    let server_addr = spawn_fake_server().await;
    let client_listen_addr = spawn_client(server_addr).await;

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.connect(client_listen_addr).await.unwrap();
    sender.send(b"hello-from-app").await.unwrap();

    let mut buf = [0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(2), sender.recv(&mut buf))
        .await
        .expect("timed out waiting for echo")
        .unwrap();
    assert_eq!(&buf[..n], b"hello-from-app");
}

#[tokio::test]
async fn two_local_senders_are_isolated_on_distinct_tunnels() {
    let server_addr = spawn_fake_server().await;
    let client_listen_addr = spawn_client(server_addr).await;

    // Sender A goes first and is driven to completion before B appears, so
    // the engine's `NEW` request for B's tunnel is sent once the carrier is
    // already `Ready` rather than raced against the initial handshake.
    let sender_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender_a.connect(client_listen_addr).await.unwrap();
    sender_a.send(b"from-a").await.unwrap();

    let mut buf_a = [0u8; 2048];
    let n_a = tokio::time::timeout(Duration::from_secs(2), sender_a.recv(&mut buf_a))
        .await
        .expect("sender A timed out")
        .unwrap();
    assert_eq!(&buf_a[..n_a], b"from-a");

    let sender_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender_b.connect(client_listen_addr).await.unwrap();
    sender_b.send(b"from-b").await.unwrap();

    let mut buf_b = [0u8; 2048];
    let n_b = tokio::time::timeout(Duration::from_secs(2), sender_b.recv(&mut buf_b))
        .await
        .expect("sender B timed out")
        .unwrap();
    assert_eq!(&buf_b[..n_b], b"from-b");

    // A still sees its own further traffic land on the same tunnel.
    sender_a.send(b"from-a-again").await.unwrap();
    let n_a2 = tokio::time::timeout(Duration::from_secs(2), sender_a.recv(&mut buf_a))
        .await
        .expect("sender A second round timed out")
        .unwrap();
    assert_eq!(&buf_a[..n_a2], b"from-a-again");
}
