//! Application lifecycle: config validation, tracing init, UDP listener
//! bootstrap, datagram engine startup, and graceful shutdown. Mirrors the
//! server's `app.rs` lifecycle shape (`init_tracing` + `watch` shutdown
//! channel + `wait_for_shutdown`), re-pointed at a single outbound carrier
//! connection instead of an inbound listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::engine::Engine;
use crate::{metrics, udp};

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    let config = Arc::new(config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        websocket_uri = %config.websocket_uri,
        route = %config.route,
        old_protocol = config.use_old_protocol,
        "streamsockets-client starting"
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.bind_port).parse()?;
    let sockets = udp::bind_listeners(bind_addr, config.udp_listeners)?;
    let local_socket = Arc::clone(&sockets[0]);

    metrics::init(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let engine = Engine::new(Arc::clone(&config), local_socket, shutdown_rx);
    udp::spawn_listeners(sockets, engine.inbox_sender());

    let engine_handle = tokio::spawn(engine.run());

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    let _ = engine_handle.await;

    info!("streamsockets-client stopped");
    Ok(())
}

pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{reload, EnvFilter};

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, _reload_handle) = reload::Layer::new(filter);

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
