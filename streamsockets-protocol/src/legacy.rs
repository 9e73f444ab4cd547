//! Old-protocol JSON control messages (§6.2), kept for backward compatibility.

use serde::{Deserialize, Serialize};

/// client -> server: requests the single route for this connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub address: String,
    pub port: u16,
}

impl ConnectRequest {
    pub fn route(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// server -> client: outcome of a `ConnectRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub success: bool,
    pub message: String,
}

impl ConnectResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: "connected".to_string(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_round_trips() {
        let req = ConnectRequest {
            address: "127.0.0.1".to_string(),
            port: 8888,
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ConnectRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.route(), "127.0.0.1:8888");
    }

    #[test]
    fn connect_response_ok_shape() {
        let resp = ConnectResponse::ok();
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "connected");
    }
}
