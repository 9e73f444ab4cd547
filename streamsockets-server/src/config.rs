use clap::Parser;

/// StreamSockets server: bridges authenticated WebSocket tunnels to UDP backends.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Path to the accounts YAML file (§6.3).
    #[arg(long, env = "ACCOUNTS_CONFIG_FILE", default_value = "accounts.yaml")]
    pub accounts_config_file: String,

    /// How often to re-parse the accounts file, in seconds.
    #[arg(long, env = "ACCOUNTS_RELOAD_INTERVAL_SECONDS", default_value_t = 15)]
    pub accounts_reload_interval_seconds: u64,

    /// Header to read the client IP from instead of the TCP peer address.
    #[arg(long, env = "CLIENT_IP_HEADER")]
    pub client_ip_header: Option<String>,

    /// Parent (acceptor) thread count. Tokio's scheduler has no separate
    /// boss/worker split, so this is accepted for env-compatibility and
    /// logged but otherwise unused; see DESIGN.md.
    #[arg(long, env = "PARENT_THREADS", default_value_t = 1)]
    pub parent_threads: usize,

    /// Tokio worker thread count for the multi-threaded runtime.
    #[arg(long, env = "CHILD_THREADS")]
    pub child_threads: Option<usize>,

    /// Address to bind the WebSocket listener on.
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port to bind the WebSocket listener on.
    #[arg(long, env = "BIND_PORT", default_value_t = 8080)]
    pub bind_port: u16,

    /// Max HTTP request content length for the upgrade request, in bytes.
    #[arg(long, env = "HTTP_MAX_CONTENT_LENGTH", default_value_t = 65536)]
    pub http_max_content_length: usize,

    /// Max WebSocket frame size, in bytes.
    #[arg(long, env = "MAX_FRAME_SIZE", default_value_t = 65536)]
    pub max_frame_size: usize,

    /// HTTP path the WebSocket tunnel endpoint is served on.
    #[arg(long, env = "WS_PATH", default_value = "/tunnel")]
    pub ws_path: String,

    /// Idle timeout for non-primary tunnels, in seconds.
    #[arg(long, env = "UDP_TUNNEL_TIMEOUT_SECONDS", default_value_t = 300)]
    pub udp_tunnel_timeout_seconds: u64,

    /// Max concurrent tunnels per WebSocket connection.
    #[arg(long, env = "MAX_UDP_TUNNELS_PER_CLIENT", default_value_t = 10)]
    pub max_udp_tunnels_per_client: usize,

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
        if self.max_udp_tunnels_per_client == 0 {
            anyhow::bail!("MAX_UDP_TUNNELS_PER_CLIENT must be at least 1");
        }
        if self.max_udp_tunnels_per_client > usize::from(streamsockets_protocol::MAX_TUNNEL_ID) {
            anyhow::bail!(
                "MAX_UDP_TUNNELS_PER_CLIENT cannot exceed {} (tunnel ids are single bytes)",
                streamsockets_protocol::MAX_TUNNEL_ID
            );
        }
        if !self.ws_path.starts_with('/') {
            anyhow::bail!("WS_PATH must start with '/'");
        }
        Ok(())
    }

    pub fn metrics_bind_address(&self) -> String {
        self.metrics_bind_address
            .clone()
            .unwrap_or_else(|| self.bind_address.clone())
    }
}
