//! Local UDP ingress (supplementary to C5, implied by "local UDP port").
//!
//! One task per bound socket, all feeding the same engine inbox (§5: "if
//! `SO_REUSEPORT` is available, multiple sockets bind to the same port on
//! different executors; each datagram is owned by its receiving
//! executor"). Grounded in the server's `net::tune_udp_socket` use of
//! `socket2::SockRef` for buffer tuning, extended here with
//! `set_reuse_port`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::engine::EngineEvent;

const ONE_MIB: usize = 1024 * 1024;

/// Bind `count` UDP sockets to `addr`, each with `SO_REUSEPORT` set when
/// `count > 1` (best-effort: falls back to a single socket if the
/// platform doesn't support reuseport), and spawn one listener task per
/// socket. The first bound socket is returned so the engine can also use
/// it to send replies back to local senders.
pub fn bind_listeners(addr: SocketAddr, count: usize) -> anyhow::Result<Vec<Arc<UdpSocket>>> {
    let count = count.max(1);
    let mut sockets = Vec::with_capacity(count);
    for i in 0..count {
        match bind_one(addr, count > 1) {
            Ok(socket) => sockets.push(Arc::new(socket)),
            Err(e) if i == 0 => return Err(e),
            Err(e) => {
                warn!(error = %e, "failed to bind additional SO_REUSEPORT listener, continuing with fewer");
                break;
            }
        }
    }
    Ok(sockets)
}

fn bind_one(addr: SocketAddr, reuse_port: bool) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        if let Err(e) = socket.set_reuse_port(true) {
            warn!(error = %e, "SO_REUSEPORT unavailable on this platform");
        }
    }
    socket.bind(&addr.into())?;

    let sock_ref = SockRef::from(&socket);
    let _ = sock_ref.set_recv_buffer_size(ONE_MIB);
    let _ = sock_ref.set_send_buffer_size(ONE_MIB);

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Spawn the listener tasks. Each received datagram is forwarded to the
/// engine's inbox tagged with its sender address.
pub fn spawn_listeners(sockets: Vec<Arc<UdpSocket>>, events: tokio::sync::mpsc::UnboundedSender<EngineEvent>) {
    for (idx, socket) in sockets.into_iter().enumerate() {
        let events = events.clone();
        tokio::spawn(async move {
            info!(listener = idx, local_addr = ?socket.local_addr().ok(), "udp listener started");
            let mut buf = [0u8; 65536];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, sender)) => {
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        if events.send(EngineEvent::Udp(sender, payload)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(listener = idx, error = %e, "udp recv error");
                    }
                }
            }
        });
    }
}
