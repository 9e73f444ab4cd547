//! New-protocol text control frames: `NEW`, `SOCKET ID: <n>`, `CLOSE ID: <n>`.

use crate::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// client -> server: request a new tunnel on this connection.
    New,
    /// server -> client: grant of a tunnel id.
    SocketId(u8),
    /// server -> client: eviction of a tunnel id.
    CloseId(u8),
}

impl ControlFrame {
    pub fn encode(&self) -> String {
        match self {
            Self::New => "NEW".to_string(),
            Self::SocketId(id) => format!("SOCKET ID: {id}"),
            Self::CloseId(id) => format!("CLOSE ID: {id}"),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim();
        if text == "NEW" {
            return Ok(Self::New);
        }
        if let Some(rest) = text.strip_prefix("SOCKET ID:") {
            let id = parse_id(rest)?;
            return Ok(Self::SocketId(id));
        }
        if let Some(rest) = text.strip_prefix("CLOSE ID:") {
            let id = parse_id(rest)?;
            return Ok(Self::CloseId(id));
        }
        Err(ProtocolError::UnknownControl(text.to_string()))
    }
}

fn parse_id(rest: &str) -> Result<u8, ProtocolError> {
    rest.trim()
        .parse::<u8>()
        .map_err(|_| ProtocolError::InvalidControlArg(rest.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new() {
        assert_eq!(ControlFrame::parse("NEW").unwrap(), ControlFrame::New);
    }

    #[test]
    fn round_trips_socket_id() {
        let frame = ControlFrame::SocketId(42);
        let encoded = frame.encode();
        assert_eq!(encoded, "SOCKET ID: 42");
        assert_eq!(ControlFrame::parse(&encoded).unwrap(), frame);
    }

    #[test]
    fn round_trips_close_id() {
        let frame = ControlFrame::CloseId(3);
        let encoded = frame.encode();
        assert_eq!(ControlFrame::parse(&encoded).unwrap(), frame);
    }

    #[test]
    fn rejects_unknown() {
        assert!(ControlFrame::parse("PING").is_err());
    }

    #[test]
    fn rejects_bad_id() {
        assert!(ControlFrame::parse("SOCKET ID: abc").is_err());
    }
}
