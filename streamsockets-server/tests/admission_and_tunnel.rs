//! End-to-end admission + tunnel round-trip tests, exercising the server
//! through a real `TcpListener`/axum router rather than unit-testing its
//! pieces in isolation (§8 properties 1/2/6/8, scenarios E1-E4 analogues).

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, Request};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use streamsockets_protocol::DataFrame;
use streamsockets_server::accounts::AccountStore;
use streamsockets_server::config::Config;
use streamsockets_server::state::AppState;

fn write_accounts(yaml: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    f
}

/// A UDP echo backend standing in for the real application behind the
/// server's route (§1 "out of scope: the actual UDP echo application").
async fn spawn_echo_udp() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// Boots the router directly against a fresh `AccountStore`, bypassing
/// `app::run` entirely so tests never touch the global metrics recorder or
/// install a competing Prometheus listener across test threads.
async fn spawn_server(accounts_path: &Path, client_ip_header: Option<&str>) -> SocketAddr {
    let mut args = vec![
        "streamsockets-server".to_string(),
        "--accounts-config-file".to_string(),
        accounts_path.display().to_string(),
    ];
    if let Some(header) = client_ip_header {
        args.push("--client-ip-header".to_string());
        args.push(header.to_string());
    }
    let config = Config::parse_from(args);
    let accounts = Arc::new(AccountStore::load(accounts_path).unwrap());
    let state = Arc::new(AppState {
        config: Arc::new(config),
        accounts,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = streamsockets_server::server::router(state)
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

fn upgrade_request(server_addr: SocketAddr, token: &str, route: &str) -> Request<()> {
    let mut request = format!("ws://{server_addr}/tunnel")
        .into_client_request()
        .unwrap();
    let (host, port) = route.rsplit_once(':').unwrap();
    let headers = request.headers_mut();
    headers.insert("x-auth-type", "Token".parse().unwrap());
    headers.insert("x-auth-token", token.parse().unwrap());
    headers.insert("x-route-address", host.parse().unwrap());
    headers.insert("x-route-port", port.parse().unwrap());
    request
}

fn with_header(mut request: Request<()>, header: &str, value: &str) -> Request<()> {
    request
        .headers_mut()
        .insert(header.parse::<HeaderName>().unwrap(), value.parse().unwrap());
    request
}

async fn connect(server_addr: SocketAddr, request: Request<()>) -> WebSocketStream<TcpStream> {
    let tcp = TcpStream::connect(server_addr).await.unwrap();
    let (ws, _response) = tokio_tungstenite::client_async(request, tcp).await.unwrap();
    ws
}

async fn rejection_status(server_addr: SocketAddr, request: Request<()>) -> u16 {
    let tcp = TcpStream::connect(server_addr).await.unwrap();
    match tokio_tungstenite::client_async(request, tcp).await {
        Ok(_) => panic!("expected the upgrade to be rejected"),
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {e}"),
    }
}

const ACCOUNTS_TEMPLATE: &str = r#"
accounts:
  - name: user1
    token: 'tok1'
    reuse: false
    routes: ['{route}']
    allowedIps: ['127.0.0.1', '172.16.0.0/16']
  - name: cidr_only
    token: 'tok2'
    reuse: true
    routes: ['{route}']
    allowedIps: ['172.16.0.0/16']
"#;

#[tokio::test]
async fn authorized_connect_grants_and_multiplexes_tunnels() {
    let echo_addr = spawn_echo_udp().await;
    let route = echo_addr.to_string();
    let yaml = ACCOUNTS_TEMPLATE.replace("{route}", &route);
    let accounts = write_accounts(&yaml);
    let server_addr = spawn_server(accounts.path(), None).await;

    let mut ws = connect(server_addr, upgrade_request(server_addr, "tok1", &route)).await;

    let grant = tokio::time::timeout(Duration::from_secs(2), next_text(&mut ws))
        .await
        .unwrap();
    assert_eq!(grant, "SOCKET ID: 1");

    ws.send(Message::Text("NEW".to_string().into())).await.unwrap();
    let second_grant = tokio::time::timeout(Duration::from_secs(2), next_text(&mut ws))
        .await
        .unwrap();
    assert_eq!(second_grant, "SOCKET ID: 2");

    let frame = DataFrame::new(1, bytes::Bytes::from_static(b"hello-tunnel-1"));
    ws.send(Message::Binary(frame.encode())).await.unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(2), next_binary(&mut ws))
        .await
        .unwrap();
    let decoded = DataFrame::decode(echoed).unwrap();
    assert_eq!(decoded.tunnel_id, 1);
    assert_eq!(&decoded.payload[..], b"hello-tunnel-1");
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let echo_addr = spawn_echo_udp().await;
    let route = echo_addr.to_string();
    let yaml = ACCOUNTS_TEMPLATE.replace("{route}", &route);
    let accounts = write_accounts(&yaml);
    let server_addr = spawn_server(accounts.path(), None).await;

    let request = upgrade_request(server_addr, "not-a-real-token", &route);
    assert_eq!(rejection_status(server_addr, request).await, 401);
}

#[tokio::test]
async fn reuse_false_account_rejects_second_concurrent_connection() {
    let echo_addr = spawn_echo_udp().await;
    let route = echo_addr.to_string();
    let yaml = ACCOUNTS_TEMPLATE.replace("{route}", &route);
    let accounts = write_accounts(&yaml);
    let server_addr = spawn_server(accounts.path(), None).await;

    let _first_ws = connect(server_addr, upgrade_request(server_addr, "tok1", &route)).await;

    let second_request = upgrade_request(server_addr, "tok1", &route);
    assert_eq!(rejection_status(server_addr, second_request).await, 403);
}

#[tokio::test]
async fn cidr_allow_list_is_enforced_via_client_ip_header() {
    let echo_addr = spawn_echo_udp().await;
    let route = echo_addr.to_string();
    let yaml = ACCOUNTS_TEMPLATE.replace("{route}", &route);
    let accounts = write_accounts(&yaml);
    let server_addr = spawn_server(accounts.path(), Some("x-forwarded-for")).await;

    let denied = with_header(
        upgrade_request(server_addr, "tok2", &route),
        "x-forwarded-for",
        "10.0.0.1",
    );
    assert_eq!(rejection_status(server_addr, denied).await, 401);

    let allowed = with_header(
        upgrade_request(server_addr, "tok2", &route),
        "x-forwarded-for",
        "172.16.5.9",
    );
    let mut ws = connect(server_addr, allowed).await;
    let grant = tokio::time::timeout(Duration::from_secs(2), next_text(&mut ws))
        .await
        .unwrap();
    assert_eq!(grant, "SOCKET ID: 1");
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        match ws.next().await.expect("stream ended").unwrap() {
            Message::Text(text) => return text.to_string(),
            _ => continue,
        }
    }
}

async fn next_binary(ws: &mut WebSocketStream<TcpStream>) -> bytes::Bytes {
    loop {
        match ws.next().await.expect("stream ended").unwrap() {
            Message::Binary(data) => return data,
            _ => continue,
        }
    }
}
