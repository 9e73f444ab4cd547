//! Client WebSocket Carrier (C6).
//!
//! One run of this module is one connection attempt/session: TCP connect
//! with timeout, `socket2` tuning, TLS connector selection, WS handshake,
//! spawn a dedicated writer task, then drive a read loop until the socket
//! closes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{http, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

use streamsockets_protocol::{ConnectRequest, ConnectResponse, ControlFrame, DataFrame};

use crate::config::Config;
use crate::engine::{CarrierEvent, EngineEvent, OLD_PROTOCOL_TUNNEL_ID};

/// Write channel capacity. `tokio-tungstenite` exposes no raw byte-level
/// water mark, so a 1 MiB/512 KiB high/low mark is approximated by a
/// bounded message channel instead (see DESIGN.md); a full datagram is at
/// most ~1500 bytes, so 1024 slots comfortably covers a 1 MiB high-water
/// mark.
const WRITE_CHANNEL_CAPACITY: usize = 1024;

/// Handle the engine uses to push frames out through the active carrier.
#[derive(Clone)]
pub struct CarrierHandle {
    tx: mpsc::Sender<Message>,
}

impl CarrierHandle {
    pub fn try_send(&self, message: Message) -> bool {
        self.tx.try_send(message).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn for_test(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }
}

/// Run one carrier session to completion. Every event (including the
/// terminal one) is tagged with `epoch` so a stale listener in the engine
/// can recognize and discard events from a superseded attempt (§4.5).
pub async fn run(config: Arc<Config>, epoch: u64, events: mpsc::UnboundedSender<EngineEvent>) {
    match run_inner(&config, epoch, &events).await {
        Ok(()) => debug!(epoch, "carrier session ended"),
        Err(e) => warn!(epoch, error = %e, "carrier session failed"),
    }
    let _ = events.send(EngineEvent::CarrierEnded(epoch));
}

async fn run_inner(
    config: &Config,
    epoch: u64,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> anyhow::Result<()> {
    let mut request = config.websocket_uri.clone().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("X-Auth-Type", http::HeaderValue::from_static("Token"));
    headers.insert("X-Auth-Token", http::HeaderValue::from_str(&config.auth_token)?);
    if config.use_old_protocol {
        headers.insert("X-Auth-Route", http::HeaderValue::from_str(&config.route)?);
    } else {
        let (addr, port) = split_route(&config.route)?;
        headers.insert("X-Route-Address", http::HeaderValue::from_str(addr)?);
        headers.insert("X-Route-Port", http::HeaderValue::from_str(port)?);
    }

    let uri: http::Uri = config.websocket_uri.parse()?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("missing host in WEBSOCKET_URI"))?
        .to_string();
    let is_tls = uri.scheme_str() == Some("wss");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let tcp_stream = TcpStream::connect((host.as_str(), port)).await?;
    configure_tcp_socket(&tcp_stream);

    let connector = if is_tls {
        Some(tokio_tungstenite::Connector::Rustls(Arc::new(build_tls_config())))
    } else {
        None
    };

    let ws_config = WebSocketConfig::default();
    let (ws_stream, _response) = tokio::time::timeout(
        Duration::from_secs(10),
        tokio_tungstenite::client_async_tls_with_config(request, tcp_stream, Some(ws_config), connector),
    )
    .await??;

    info!(epoch, uri = %config.websocket_uri, old_protocol = config.use_old_protocol, "carrier connected");

    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WRITE_CHANNEL_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!(error = %e, "carrier write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });
    let handle = CarrierHandle { tx: tx.clone() };

    if config.use_old_protocol {
        let req = build_legacy_request(&config.route)?;
        let text = serde_json::to_string(&req)?;
        tx.send(Message::Text(text.into())).await?;

        let response = next_legacy_response(&mut stream).await?;
        if !response.success {
            anyhow::bail!("server rejected old-protocol connect request: {}", response.message);
        }
    }

    let _ = events.send(EngineEvent::Carrier(epoch, CarrierEvent::Ready(handle)));

    let result = read_loop(config, epoch, &mut stream, events).await;
    drop(tx);
    let _ = writer.await;
    result
}

async fn read_loop(
    config: &Config,
    epoch: u64,
    stream: &mut SplitStream<WsStream>,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> anyhow::Result<()> {
    while let Some(msg) = stream.next().await {
        let msg = msg?;
        let event = match msg {
            Message::Binary(data) => Some(decode_binary(config, data)?),
            Message::Text(text) => decode_text(&text),
            Message::Pong(_) => Some(CarrierEvent::Pong),
            Message::Ping(_) => None,
            Message::Close(frame) => {
                debug!(epoch, ?frame, "carrier received close");
                break;
            }
            Message::Frame(_) => None,
        };
        if let Some(event) = event {
            if events.send(EngineEvent::Carrier(epoch, event)).is_err() {
                break;
            }
        }
    }
    Ok(())
}

fn decode_binary(config: &Config, data: Bytes) -> anyhow::Result<CarrierEvent> {
    if config.use_old_protocol {
        Ok(CarrierEvent::Data(OLD_PROTOCOL_TUNNEL_ID, data))
    } else {
        let frame = DataFrame::decode(data)?;
        Ok(CarrierEvent::Data(frame.tunnel_id, frame.payload))
    }
}

fn decode_text(text: &str) -> Option<CarrierEvent> {
    match ControlFrame::parse(text) {
        Ok(ControlFrame::SocketId(id)) => Some(CarrierEvent::SocketId(id)),
        Ok(ControlFrame::CloseId(id)) => Some(CarrierEvent::CloseId(id)),
        Ok(ControlFrame::New) => {
            warn!("ignoring server-originated NEW (client-only frame)");
            None
        }
        Err(e) => {
            warn!(error = %e, "dropping unrecognized text frame");
            None
        }
    }
}

async fn next_legacy_response(
    stream: &mut SplitStream<WsStream>,
) -> anyhow::Result<ConnectResponse> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(_) => anyhow::bail!("carrier closed before old-protocol handshake completed"),
            _ => continue,
        }
    }
    anyhow::bail!("carrier ended before old-protocol handshake completed")
}

fn build_legacy_request(route: &str) -> anyhow::Result<ConnectRequest> {
    let (addr, port) = split_route(route)?;
    Ok(ConnectRequest {
        address: addr.to_string(),
        port: port.parse()?,
    })
}

fn split_route(route: &str) -> anyhow::Result<(&str, &str)> {
    route
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("ROUTE must be host:port, got {:?}", route))
}

/// TLS 1.2/1.3 only, endpoint identification enabled (rustls verifies the
/// hostname against the certificate by default — there is no separate
/// "disable" knob to avoid here, unlike some other TLS stacks).
fn build_tls_config() -> rustls::ClientConfig {
    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn configure_tcp_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY on carrier socket");
    }
    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "failed to set SO_KEEPALIVE on carrier socket");
    }
}
