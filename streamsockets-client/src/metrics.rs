//! Prometheus exposition for the counters/gauges listed in spec §6.5.
//!
//! The client has no account concept, so the `account_name` label from the
//! server side becomes `route` here — the one piece of identity a single
//! client connection has. Same exporter crate as the server
//! (`metrics-exporter-prometheus`), same bucket set.

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::{info, warn};

use crate::config::Config;

const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0];

pub fn init(config: &Config) -> anyhow::Result<()> {
    if !config.metrics_enabled {
        info!("metrics disabled");
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.metrics_bind_address(), config.metrics_port)
        .parse()?;

    if config.metrics_path != "/metrics" {
        warn!(
            path = %config.metrics_path,
            "METRICS_PATH is only advisory: the installed exporter always serves at the listener root"
        );
    }

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("connection_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .with_http_listener(addr)
        .install()?;

    info!(%addr, "metrics endpoint listening");
    Ok(())
}

pub fn connection_opened(route: &str) {
    metrics::gauge!("active_connections", "route" => route.to_string()).increment(1.0);
    metrics::gauge!("connection_status", "route" => route.to_string()).set(1.0);
    metrics::counter!("total_connections", "route" => route.to_string()).increment(1);
}

pub fn connection_closed(route: &str, duration: Duration) {
    metrics::gauge!("active_connections", "route" => route.to_string()).decrement(1.0);
    metrics::gauge!("connection_status", "route" => route.to_string()).set(0.0);
    metrics::histogram!("connection_duration_seconds", "route" => route.to_string())
        .record(duration.as_secs_f64());
}

pub fn bytes_received(route: &str, n: u64) {
    metrics::counter!("bytes_received_total", "route" => route.to_string()).increment(n);
}

pub fn bytes_sent(route: &str, n: u64) {
    metrics::counter!("bytes_sent_total", "route" => route.to_string()).increment(n);
}
