//! Server UDP Downstream (C9).
//!
//! One task per tunnel, spawned against an already-connected `UdpSocket`
//! (each tunnel's socket is `connect()`-ed to its route so `recv` yields
//! only datagrams from that one peer).

use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::admission::Protocol;
use crate::metrics;
use crate::writer::WsSender;

/// Spawn the downstream reader for one tunnel. The task runs until the
/// socket is dropped (which happens when the owning `Tunnel` is removed
/// from the registry and this handle is aborted alongside it).
pub fn spawn_downstream(
    socket: Arc<UdpSocket>,
    tunnel_id: u8,
    protocol: Protocol,
    writer: WsSender,
    account_name: Arc<str>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(tunnel_id, error = %e, "udp downstream recv failed, closing");
                    break;
                }
            };
            if n == 0 {
                continue;
            }

            let payload = Bytes::copy_from_slice(&buf[..n]);
            let message = match protocol {
                Protocol::New => {
                    Message::Binary(streamsockets_protocol::DataFrame::new(tunnel_id, payload).encode())
                }
                Protocol::Old => Message::Binary(payload),
            };

            if writer.try_send(message).is_err() {
                warn!(tunnel_id, "ws writer channel full, datagram dropped");
                continue;
            }
            metrics::bytes_sent(&account_name, n as u64);
        }
    })
}
