//! Server Admission Gate (C7).
//!
//! Runs in front of the WebSocket upgrade route: parses auth/route headers,
//! authenticates and leases via C1, and hands back the metadata the
//! connection handler (C8) attaches to the session. Client IP resolution
//! falls back from an `X-Forwarded-For`-style header to the socket's
//! `ConnectInfo` peer address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::accounts::Account;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    New,
    Old,
}

pub struct ConnectionMeta {
    pub account: Arc<Account>,
    pub protocol: Protocol,
    /// The route for the new protocol; `None` for the old protocol, which
    /// negotiates its route via the first JSON text frame instead (§4.8).
    pub route: Option<String>,
    pub client_ip: IpAddr,
    pub started_at: Instant,
}

pub enum AdmissionError {
    BadRequest(&'static str),
    Unauthorized,
    Forbidden,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            Self::Forbidden => {
                (StatusCode::FORBIDDEN, "Failed to lease account").into_response()
            }
        }
    }
}

/// Run the admission checks (§4.7 steps 1-5). On success the account is
/// already leased; the caller must release it when the connection closes.
pub fn admit(
    state: &AppState,
    headers: &HeaderMap,
    peer_addr: SocketAddr,
) -> Result<ConnectionMeta, AdmissionError> {
    let auth_type = headers
        .get("x-auth-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !auth_type.eq_ignore_ascii_case("Token") {
        warn!(auth_type, "admission rejected: invalid authentication type");
        return Err(AdmissionError::BadRequest("Invalid authentication type"));
    }

    let token = headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .ok_or(AdmissionError::BadRequest("Missing X-Auth-Token"))?;

    let client_ip = extract_client_ip(state, headers, peer_addr);

    let route_address = headers.get("x-route-address").and_then(|v| v.to_str().ok());
    let route_port = headers.get("x-route-port").and_then(|v| v.to_str().ok());

    let (protocol, route) = match (route_address, route_port) {
        (Some(addr), Some(port)) => (Protocol::New, format!("{addr}:{port}")),
        _ => {
            let route = headers
                .get("x-auth-route")
                .and_then(|v| v.to_str().ok())
                .ok_or(AdmissionError::BadRequest(
                    "Missing route headers (X-Route-Address/X-Route-Port or X-Auth-Route)",
                ))?
                .to_string();
            (Protocol::Old, route)
        }
    };

    let account = state
        .accounts
        .authenticate(token, &route, client_ip)
        .ok_or_else(|| {
            debug!(%route, %client_ip, "admission rejected: authentication failed");
            AdmissionError::Unauthorized
        })?;

    if !account.lease() {
        debug!(account = %account.name, "admission rejected: lease refused");
        return Err(AdmissionError::Forbidden);
    }

    Ok(ConnectionMeta {
        account,
        protocol,
        route: match protocol {
            Protocol::New => Some(route),
            Protocol::Old => None,
        },
        client_ip,
        started_at: Instant::now(),
    })
}

fn extract_client_ip(state: &AppState, headers: &HeaderMap, peer_addr: SocketAddr) -> IpAddr {
    if let Some(header_name) = &state.config.client_ip_header {
        if let Some(value) = headers
            .get(header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return value;
        }
    }
    peer_addr.ip()
}
