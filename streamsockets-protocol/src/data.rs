//! New-protocol binary data frames: `tunnel_id (1B) || payload (NB)`.

use bytes::{Bytes, BytesMut};

use crate::{ProtocolError, RESERVED_TUNNEL_ID};

/// A single demultiplexed UDP payload tagged with its tunnel id.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub tunnel_id: u8,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn new(tunnel_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tunnel_id,
            payload: payload.into(),
        }
    }

    /// Encode into a binary WebSocket message body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.extend_from_slice(&[self.tunnel_id]);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a received binary message under the new protocol.
    ///
    /// Rejects tunnel id 0 (reserved) per §6.1; callers that queue frames
    /// with the placeholder id before a grant arrives must rewrite the id
    /// before ever calling this on the receive path.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let tunnel_id = data.split_to(1)[0];
        if tunnel_id == RESERVED_TUNNEL_ID {
            return Err(ProtocolError::ReservedTunnelId(tunnel_id));
        }
        Ok(Self {
            tunnel_id,
            payload: data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let frame = DataFrame::new(7, Bytes::from_static(b"hello"));
        let encoded = frame.encode();
        let decoded = DataFrame::decode(encoded).unwrap();
        assert_eq!(decoded.tunnel_id, 7);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn rejects_reserved_id() {
        let encoded = Bytes::from_static(&[0, 1, 2, 3]);
        assert!(matches!(
            DataFrame::decode(encoded),
            Err(ProtocolError::ReservedTunnelId(0))
        ));
    }

    #[test]
    fn rejects_empty() {
        assert!(matches!(
            DataFrame::decode(Bytes::new()),
            Err(ProtocolError::EmptyFrame)
        ));
    }
}
