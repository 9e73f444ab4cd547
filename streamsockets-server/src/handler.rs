//! Server Tunnel Handler (C8).
//!
//! One instance per accepted WebSocket connection: a single task owns the
//! registry and the connection's protocol state, so none of it needs
//! locking. The idle reaper is not a separate task — like everything else
//! on this connection it runs on the same executor, folded into the read
//! loop via `tokio::select!`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use streamsockets_protocol::{ConnectRequest, ConnectResponse, ControlFrame, DataFrame};

use crate::admission::{ConnectionMeta, Protocol};
use crate::metrics;
use crate::registry::TunnelRegistry;
use crate::state::AppState;
use crate::udp;
use crate::writer::{spawn_writer, WsSender};

/// Binary frames received on an old-protocol connection before its JSON
/// handshake has completed are buffered here rather than dropped (§9 open
/// question: behavior left to the implementer). Bounded to avoid an
/// unbounded queue if the client never sends the handshake.
const PENDING_CAP: usize = 256;

pub async fn run(state: Arc<AppState>, meta: ConnectionMeta, socket: WebSocket) {
    let account_name: Arc<str> = Arc::from(meta.account.name.as_str());
    let (sink, mut stream) = socket.split();
    let (writer, writer_handle) = spawn_writer(sink);
    let reap_timeout = Duration::from_secs(state.config.udp_tunnel_timeout_seconds);
    let max_tunnels = state.config.max_udp_tunnels_per_client;

    metrics::connection_opened(&account_name);

    let mut session = Session {
        state,
        protocol: meta.protocol,
        registry: TunnelRegistry::new(max_tunnels),
        writer: writer.clone(),
        account_name: account_name.clone(),
        old_tunnel_id: None,
        pending_old: VecDeque::new(),
    };

    let activation_ok = match meta.protocol {
        Protocol::New => {
            session
                .activate_new(meta.route.as_deref().unwrap_or(""))
                .await
        }
        Protocol::Old => true, // old protocol activates on its first JSON frame
    };

    if activation_ok {
        let mut reap_interval: Option<tokio::time::Interval> = None;
        loop {
            let tick = async {
                match reap_interval.as_mut() {
                    Some(iv) => {
                        iv.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(msg)) => {
                            if !session.on_message(msg).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "websocket read error, closing");
                            break;
                        }
                        None => break,
                    }
                }
                _ = tick => {
                    session.reap().await;
                }
            }

            if reap_interval.is_none() && session.registry.size() >= 2 {
                reap_interval = Some(tokio::time::interval(reap_timeout));
            }
            if reap_interval.is_some() && session.registry.only_first_remains() {
                reap_interval = None;
            }
        }
    }

    drop(writer);
    let _ = writer_handle.await;
    meta.account.release();
    metrics::connection_closed(&account_name, meta.started_at.elapsed());
    info!(account = %account_name, "connection closed");
}

struct Session {
    state: Arc<AppState>,
    protocol: Protocol,
    registry: TunnelRegistry,
    writer: WsSender,
    account_name: Arc<str>,
    /// The single tunnel id in use under the old protocol (routing target
    /// for binary frames, which carry no id byte of their own).
    old_tunnel_id: Option<u8>,
    pending_old: VecDeque<Bytes>,
}

impl Session {
    /// New-protocol activation (§4.8): the route was already validated
    /// against an account during admission; here it must also be
    /// *globally* configured (some account somewhere serves it).
    async fn activate_new(&mut self, route: &str) -> bool {
        if !self.state.accounts.contains_route(route) {
            warn!(route, "route not globally configured, closing connection");
            return false;
        }
        match self.open_tunnel(route).await {
            Ok(id) => {
                self.send_control(ControlFrame::SocketId(id)).await;
                true
            }
            Err(e) => {
                warn!(route, error = %e, "failed to open first udp tunnel, closing");
                false
            }
        }
    }

    async fn on_message(&mut self, msg: Message) -> bool {
        match msg {
            Message::Binary(data) => self.on_binary(data).await,
            Message::Text(text) => self.on_text(text.to_string()).await,
            Message::Ping(payload) => {
                let _ = self.writer.send(Message::Pong(payload)).await;
                true
            }
            Message::Pong(_) => true,
            Message::Close(_) => {
                info!("received websocket close");
                false
            }
        }
    }

    async fn on_binary(&mut self, data: Bytes) -> bool {
        match self.protocol {
            Protocol::New => {
                let frame = match DataFrame::decode(data) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed binary frame");
                        return true;
                    }
                };
                self.forward(frame.tunnel_id, &frame.payload).await;
            }
            Protocol::Old => match self.old_tunnel_id {
                Some(id) => self.forward(id, &data).await,
                None => {
                    if self.pending_old.len() >= PENDING_CAP {
                        warn!("old-protocol pending queue full, dropping oldest frame");
                        self.pending_old.pop_front();
                    }
                    self.pending_old.push_back(data);
                }
            },
        }
        true
    }

    async fn forward(&mut self, tunnel_id: u8, payload: &[u8]) {
        match self.registry.lookup_mut(tunnel_id) {
            Some(tunnel) => {
                tunnel.touch();
                if let Err(e) = tunnel.socket.send(payload).await {
                    warn!(tunnel_id, error = %e, "udp send failed, dropping datagram");
                } else {
                    metrics::bytes_received(&self.account_name, payload.len() as u64);
                }
            }
            None => {
                debug!(tunnel_id, "dropping frame for unknown tunnel id");
            }
        }
    }

    async fn on_text(&mut self, text: String) -> bool {
        match self.protocol {
            Protocol::New => self.on_text_new(&text).await,
            Protocol::Old => self.on_text_old(&text).await,
        }
        true
    }

    async fn on_text_new(&mut self, text: &str) {
        let frame = match ControlFrame::parse(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "dropping unrecognized control frame");
                return;
            }
        };
        match frame {
            ControlFrame::New => self.on_new_request().await,
            // The server only ever sends grants/evictions, never receives them.
            ControlFrame::SocketId(_) | ControlFrame::CloseId(_) => {
                warn!("ignoring server-originated control frame received from client");
            }
        }
    }

    async fn on_new_request(&mut self) {
        if self.registry.size() >= self.state.config.max_udp_tunnels_per_client {
            warn!("tunnel cap reached, dropping NEW request");
            return;
        }
        let route = match self
            .registry
            .lookup(self.registry.first_id().unwrap_or(0))
        {
            Some(t) => t.remote_endpoint.clone(),
            None => {
                warn!("NEW requested with no first tunnel open, dropping");
                return;
            }
        };
        match self.open_tunnel(&route).await {
            Ok(id) => self.send_control(ControlFrame::SocketId(id)).await,
            Err(e) => warn!(route, error = %e, "failed to open additional udp tunnel"),
        }
    }

    async fn on_text_old(&mut self, text: &str) {
        let request: ConnectRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "invalid old-protocol connect request");
                self.send_json(&ConnectResponse::fail(e.to_string())).await;
                return;
            }
        };
        let route = request.route();

        if let Some(old_id) = self.old_tunnel_id.take() {
            self.registry.close(old_id);
        }

        match self.open_tunnel(&route).await {
            Ok(id) => {
                self.old_tunnel_id = Some(id);
                self.send_json(&ConnectResponse::ok()).await;
                for payload in self.pending_old.drain(..).collect::<Vec<_>>() {
                    self.forward(id, &payload).await;
                }
            }
            Err(e) => {
                warn!(route, error = %e, "failed to open udp socket for old-protocol route");
                self.send_json(&ConnectResponse::fail(e.to_string())).await;
                self.pending_old.clear();
            }
        }
    }

    async fn open_tunnel(&mut self, route: &str) -> anyhow::Result<u8> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(route).await?;
        crate::net::tune_udp_socket(&socket);
        let socket = Arc::new(socket);
        let protocol = self.protocol;
        let writer = self.writer.clone();
        let account_name = self.account_name.clone();
        let registry_socket = Arc::clone(&socket);

        let id = self
            .registry
            .create(registry_socket, route.to_string(), move |id| {
                udp::spawn_downstream(socket, id, protocol, writer, account_name)
            })?;
        Ok(id)
    }

    /// Close every non-first tunnel idle past the configured timeout and
    /// notify the client with a `CLOSE ID` for each (§4.8).
    async fn reap(&mut self) {
        let reaped = self
            .registry
            .reap_idle(Duration::from_secs(self.state.config.udp_tunnel_timeout_seconds));
        for id in reaped {
            self.send_control(ControlFrame::CloseId(id)).await;
        }
    }

    async fn send_control(&mut self, frame: ControlFrame) {
        let _ = self.writer.send(Message::Text(frame.encode().into())).await;
    }

    async fn send_json(&mut self, resp: &ConnectResponse) {
        if let Ok(text) = serde_json::to_string(resp) {
            let _ = self.writer.send(Message::Text(text.into())).await;
        }
    }
}
