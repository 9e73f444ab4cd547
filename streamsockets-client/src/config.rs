use clap::Parser;

/// StreamSockets client: forwards local UDP datagrams over a WebSocket tunnel.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Tokio worker thread count for the multi-threaded runtime.
    #[arg(long, env = "THREADS")]
    pub threads: Option<usize>,

    /// Address to bind the local UDP listener on.
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port to bind the local UDP listener on.
    #[arg(long, env = "BIND_PORT", default_value_t = 9000)]
    pub bind_port: u16,

    /// Number of `SO_REUSEPORT` UDP listener sockets to bind, each feeding
    /// the same datagram engine inbox (§5 concurrency surface). `1` disables
    /// the reuseport fan-out entirely.
    #[arg(long, env = "UDP_LISTENERS", default_value_t = 1)]
    pub udp_listeners: usize,

    /// WebSocket URI of the StreamSockets server.
    #[arg(
        long,
        env = "WEBSOCKET_URI",
        default_value = "ws://localhost:8080/tunnel"
    )]
    pub websocket_uri: String,

    /// Token presented as `X-Auth-Token` during the upgrade handshake.
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: String,

    /// UDP backend route, `host:port`, forwarded to the server as
    /// `X-Route-Address`/`X-Route-Port` (new protocol) or `X-Auth-Route`
    /// (old protocol).
    #[arg(long, env = "ROUTE")]
    pub route: String,

    /// Speak the old (pre-multiplexing) protocol instead of the default.
    #[arg(long, env = "USE_OLD_PROTOCOL", default_value_t = false)]
    pub use_old_protocol: bool,

    /// Ping emission interval, in milliseconds (§4.4).
    #[arg(long, env = "PING_INTERVAL_MILLIS", default_value_t = 5000)]
    pub ping_interval_millis: u64,

    /// Pong staleness threshold, in milliseconds (§4.4).
    #[arg(long, env = "PING_TIMEOUT_MILLIS", default_value_t = 10000)]
    pub ping_timeout_millis: u64,

    /// Retry Controller initial delay, in seconds (§4.2).
    #[arg(long, env = "RETRY_INITIAL_DELAY_SECONDS", default_value_t = 1)]
    pub retry_initial_delay_seconds: u64,

    /// Retry Controller delay cap, in seconds (§4.2).
    #[arg(long, env = "RETRY_MAX_DELAY_SECONDS", default_value_t = 30)]
    pub retry_max_delay_seconds: u64,

    /// Seconds of local UDP inactivity before the carrier is closed (§4.5).
    #[arg(long, env = "UDP_TIMEOUT", default_value_t = 300)]
    pub udp_timeout: u64,

    /// Max concurrent tunnels this client will request (mirrors the
    /// server's `MAX_UDP_TUNNELS_PER_CLIENT`; prevents the engine from
    /// sending `NEW` past the point the server would refuse it anyway).
    #[arg(long, env = "MAX_UDP_TUNNELS_PER_CLIENT", default_value_t = 10)]
    pub max_udp_tunnels_per_client: usize,

    /// Exit the process (non-zero) on carrier failure instead of retrying
    /// forever, so an external supervisor can restart it (§4.10).
    #[arg(long, env = "EXIT_ON_FAILURE", default_value_t = false)]
    pub exit_on_failure: bool,

    /// Whether to expose a Prometheus metrics endpoint.
    #[arg(long, env = "METRICS_ENABLED", default_value_t = true)]
    pub metrics_enabled: bool,

    /// Address the metrics endpoint binds on (defaults to `bind_address`).
    #[arg(long, env = "METRICS_BIND_ADDRESS")]
    pub metrics_bind_address: Option<String>,

    /// Port the metrics endpoint binds on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// HTTP path the metrics endpoint is served on.
    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// Log level filter (passed to `tracing_subscriber::EnvFilter`).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_token.is_empty() {
            anyhow::bail!("AUTH_TOKEN must not be empty");
        }
        if self.route.parse::<std::net::SocketAddr>().is_err() && self.route.split_once(':').is_none() {
            anyhow::bail!("ROUTE must be a host:port pair, got {:?}", self.route);
        }
        if self.ping_timeout_millis <= self.ping_interval_millis {
            anyhow::bail!("PING_TIMEOUT_MILLIS must be greater than PING_INTERVAL_MILLIS");
        }
        if self.max_udp_tunnels_per_client == 0 {
            anyhow::bail!("MAX_UDP_TUNNELS_PER_CLIENT must be at least 1");
        }
        if self.max_udp_tunnels_per_client > usize::from(streamsockets_protocol::MAX_TUNNEL_ID) {
            anyhow::bail!(
                "MAX_UDP_TUNNELS_PER_CLIENT cannot exceed {} (tunnel ids are single bytes)",
                streamsockets_protocol::MAX_TUNNEL_ID
            );
        }
        Ok(())
    }

    pub fn metrics_bind_address(&self) -> String {
        self.metrics_bind_address
            .clone()
            .unwrap_or_else(|| self.bind_address.clone())
    }
}
