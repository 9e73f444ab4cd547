//! Prometheus exposition for the counters/gauges listed in spec §6.5.
//!
//! How metric families get serialized is explicitly out of scope (§1); this
//! module only emits the values. Exposition itself uses
//! `metrics-exporter-prometheus`, the crate the retrieval pack reaches for
//! instead of hand-rolling text formatting (see other_examples manifests).

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing::{info, warn};

use crate::config::Config;

const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0];

/// Install the global recorder and, if enabled, bind the HTTP exposition
/// listener. Returns immediately; the listener runs on a spawned task.
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

pub fn connection_opened(account_name: &str) {
    metrics::gauge!("active_connections", "account_name" => account_name.to_string()).increment(1.0);
    metrics::gauge!("connection_status", "account_name" => account_name.to_string()).set(1.0);
    metrics::counter!("total_connections", "account_name" => account_name.to_string()).increment(1);
}

pub fn connection_closed(account_name: &str, duration: Duration) {
    metrics::gauge!("active_connections", "account_name" => account_name.to_string()).decrement(1.0);
    metrics::gauge!("connection_status", "account_name" => account_name.to_string()).set(0.0);
    metrics::histogram!("connection_duration_seconds", "account_name" => account_name.to_string())
        .record(duration.as_secs_f64());
}

pub fn bytes_received(account_name: &str, n: u64) {
    metrics::counter!("bytes_received_total", "account_name" => account_name.to_string())
        .increment(n);
}

pub fn bytes_sent(account_name: &str, n: u64) {
    metrics::counter!("bytes_sent_total", "account_name" => account_name.to_string()).increment(n);
}
