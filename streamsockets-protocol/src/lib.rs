//! Wire protocol shared by the StreamSockets client and server.
//!
//! Frame layout on the WebSocket carrier (new protocol):
//! ```text
//! Binary:  tunnel_id (1B) || udp payload (NB)
//! Text:    "NEW" | "SOCKET ID: <n>" | "CLOSE ID: <n>"
//! ```
//! The old protocol carries raw UDP payloads as binary frames (no tunnel
//! id byte, one tunnel per connection) and negotiates the single route
//! via a JSON text frame instead of headers-per-tunnel.

pub mod control;
pub mod data;
pub mod legacy;

pub use control::ControlFrame;
pub use data::DataFrame;
pub use legacy::{ConnectRequest, ConnectResponse};

/// Tunnel id 0 is reserved as a placeholder for frames queued before the
/// server has granted a real id.
pub const RESERVED_TUNNEL_ID: u8 = 0;

/// Highest assignable tunnel id — ids are single bytes, 1..=255.
pub const MAX_TUNNEL_ID: u8 = 255;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("binary frame is empty, cannot read tunnel id")]
    EmptyFrame,
    #[error("tunnel id {0} is reserved and cannot carry data")]
    ReservedTunnelId(u8),
    #[error("unrecognized control frame: {0:?}")]
    UnknownControl(String),
    #[error("invalid control frame argument: {0}")]
    InvalidControlArg(String),
    #[error("invalid legacy JSON payload: {0}")]
    InvalidLegacyJson(#[from] serde_json::Error),
}
