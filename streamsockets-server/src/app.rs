//! Application lifecycle: config validation, tracing init, account store
//! bootstrap, reload task, and graceful shutdown via a `watch` channel
//! fanned out to every spawned task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::accounts::AccountStore;
use crate::config::Config;
use crate::state::AppState;
use crate::{metrics, server};

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        bind_port = config.bind_port,
        ws_path = %config.ws_path,
        parent_threads = config.parent_threads,
        "streamsockets-server starting"
    );

    let accounts_path = PathBuf::from(&config.accounts_config_file);
    let accounts = Arc::new(AccountStore::load(&accounts_path)?);

    metrics::init(&config)?;

    let state = Arc::new(AppState {
        config: Arc::new(config),
        accounts: Arc::clone(&accounts),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reload_interval = Duration::from_secs(state.config.accounts_reload_interval_seconds);
    let reload_handle = {
        let accounts = Arc::clone(&accounts);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(reload_interval) => {
                        accounts.reload(&accounts_path);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let serve_handle = tokio::spawn(server::serve(Arc::clone(&state), shutdown_rx));

    wait_for_shutdown().await;
    info!("shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(true);

    let _ = reload_handle.await;
    serve_handle.await??;

    info!("streamsockets-server stopped");
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
