//! HTTP/WebSocket listener wiring: the admission gate (C7) runs as an axum
//! handler in front of the upgrade, then control passes to the connection
//! handler (C8).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admission;
use crate::handler;
use crate::state::AppState;

/// `HTTP_MAX_CONTENT_LENGTH` (§6.4) bounds the upgrade request body the same
/// way `inputlayer`'s REST layer bounds its WebSocket handshake requests.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.ws_path.clone();
    let max_content_length = state.config.http_max_content_length;
    Router::new()
        .route(&ws_path, get(upgrade))
        .layer(RequestBodyLimitLayer::new(max_content_length))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let meta = match admission::admit(&state, &headers, peer_addr) {
        Ok(meta) => meta,
        Err(e) => return e.into_response(),
    };

    ws.max_frame_size(state.config.max_frame_size)
        .on_upgrade(move |socket| async move {
            handler::run(state, meta, socket).await;
        })
}

/// Bind and serve, shutting down cleanly when `shutdown` resolves (wired
/// into axum's graceful-shutdown hook).
pub async fn serve(
    state: Arc<AppState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.bind_address, state.config.bind_port)
        .parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, path = %state.config.ws_path, "websocket listener bound");

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
