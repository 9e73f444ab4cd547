//! Socket tuning shared by every tunnel's UDP socket: raises OS send/recv
//! buffers via `socket2::SockRef`.

use socket2::SockRef;
use tokio::net::UdpSocket;
use tracing::warn;

/// Raise a UDP socket's OS send/recv buffers to 1 MiB, best-effort.
pub fn tune_udp_socket(socket: &UdpSocket) {
    let sock_ref = SockRef::from(socket);
    const ONE_MIB: usize = 1024 * 1024;
    if let Err(e) = sock_ref.set_recv_buffer_size(ONE_MIB) {
        warn!(error = %e, "failed to raise udp recv buffer size");
    }
    if let Err(e) = sock_ref.set_send_buffer_size(ONE_MIB) {
        warn!(error = %e, "failed to raise udp send buffer size");
    }
}
