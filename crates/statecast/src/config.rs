use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "statecast")]
#[command(about = "Live state relay server")]
#[command(version)]
pub struct Args {
    /// Address to bind the HTTP/WebSocket listener on.
    #[arg(long, default_value = "0.0.0.0", env = "STATECAST_HOST")]
    pub host: IpAddr,
    /// Port to bind the HTTP/WebSocket listener on.
    #[arg(long, default_value = "8080", env = "STATECAST_PORT")]
    pub port: u16,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "STATECAST_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Comma-separated list of allowed origins. Empty allows every origin.
    #[arg(
        long,
        value_delimiter = ',',
        num_args = 0..,
        env = "STATECAST_ALLOWED_ORIGINS"
    )]
    pub allowed_origins: Vec<String>,
    /// Also accept origins matching an allowed scheme and hostname on another port.
    #[arg(long, env = "STATECAST_ALLOW_SAME_HOST_DIFFERENT_PORT")]
    pub allow_same_host_different_port: bool,
    /// Path of the state file written by the producer process.
    #[arg(long, default_value = "state.json", env = "STATECAST_STATE_PATH")]
    pub state_path: PathBuf,
    /// Interval between state file polls in milliseconds.
    #[arg(long, default_value = "1000", env = "STATECAST_POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "10", env = "STATECAST_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "1000", env = "STATECAST_MAX_CONNS")]
    pub max_conns: usize,
    /// Derive client IPs from forwarding headers.
    #[arg(long, env = "STATECAST_TRUST_PROXY")]
    pub trust_proxy: bool,
    /// Interval between liveness probes in milliseconds.
    #[arg(long, default_value = "15000", env = "STATECAST_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,
    /// Connections silent for longer than this are terminated (milliseconds).
    #[arg(long, default_value = "45000", env = "STATECAST_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: u64,
    /// Session token lifetime in milliseconds (never below 5000).
    #[arg(long, default_value = "60000", env = "STATECAST_SESSION_TOKEN_TTL_MS")]
    pub session_token_ttl_ms: u64,
    /// Map width announced in the welcome message when the snapshot has none.
    #[arg(long, default_value = "1000", env = "STATECAST_MAP_WIDTH")]
    pub map_width: f64,
    /// Map height announced in the welcome message when the snapshot has none.
    #[arg(long, default_value = "1000", env = "STATECAST_MAP_HEIGHT")]
    pub map_height: f64,
    /// Text of the welcome message.
    #[arg(
        long,
        default_value = "Connected to live state feed",
        env = "STATECAST_WELCOME_MESSAGE"
    )]
    pub welcome_message: String,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP/WebSocket listener on.
    pub host: IpAddr,
    /// Port to bind the HTTP/WebSocket listener on.
    pub port: u16,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Allowed origins, in configuration order.
    pub allowed_origins: Vec<String>,
    /// Accept allowed scheme+hostname pairs on any port.
    pub allow_same_host_different_port: bool,
    /// Path of the state file.
    pub state_path: PathBuf,
    /// Interval between state file polls in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Derive client IPs from forwarding headers.
    pub trust_proxy: bool,
    /// Interval between liveness probes in milliseconds.
    pub ping_interval_ms: u64,
    /// Idle timeout in milliseconds.
    pub idle_timeout_ms: u64,
    /// Requested session token lifetime in milliseconds.
    pub session_token_ttl_ms: u64,
    /// Fallback map width for the welcome message.
    pub map_width: f64,
    /// Fallback map height for the welcome message.
    pub map_height: f64,
    /// Text of the welcome message.
    pub welcome_message: String,
}

/// Session tokens never live shorter than this.
pub const MIN_SESSION_TOKEN_TTL_MS: u64 = 5_000;
/// Expired tokens are swept at least this often.
pub const MAX_TOKEN_SWEEP_INTERVAL_MS: u64 = 60_000;

impl ServerConfig {
    /// Socket address of the public listener.
    #[must_use]
    pub fn listen(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Effective token lifetime after applying the floor.
    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_millis(self.session_token_ttl_ms.max(MIN_SESSION_TOKEN_TTL_MS))
    }

    /// Period of the expired-token sweep: the TTL, capped at one minute.
    #[must_use]
    pub fn token_sweep_interval(&self) -> Duration {
        self.token_ttl()
            .min(Duration::from_millis(MAX_TOKEN_SWEEP_INTERVAL_MS))
    }

    /// Interval between state file polls.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Interval between liveness probes.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Idle timeout after which a silent connection is terminated.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }
        if self.poll_interval_ms > 3_600_000 {
            return Err("poll_interval_ms exceeds reasonable limit (1 hour)".to_string());
        }

        if self.ping_interval_ms == 0 {
            return Err("ping_interval_ms must be greater than 0".to_string());
        }
        if self.idle_timeout_ms == 0 {
            return Err("idle_timeout_ms must be greater than 0".to_string());
        }
        if self.idle_timeout_ms > 86_400_000 {
            return Err("idle_timeout_ms exceeds reasonable limit (1 day)".to_string());
        }
        if self.ping_interval_ms > self.idle_timeout_ms {
            return Err("ping_interval_ms cannot exceed idle_timeout_ms".to_string());
        }

        if self.session_token_ttl_ms > 86_400_000 {
            return Err("session_token_ttl_ms exceeds reasonable limit (1 day)".to_string());
        }

        if !(self.map_width.is_finite() && self.map_height.is_finite()) {
            return Err("map_width and map_height must be finite".to_string());
        }

        if self.state_path.as_os_str().is_empty() {
            return Err("state_path must not be empty".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            metrics_addr: args.metrics_addr,
            allowed_origins: args
                .allowed_origins
                .into_iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            allow_same_host_different_port: args.allow_same_host_different_port,
            state_path: args.state_path,
            poll_interval_ms: args.poll_interval_ms,
            max_conns_ip: args.max_conns_ip,
            max_conns: args.max_conns,
            trust_proxy: args.trust_proxy,
            ping_interval_ms: args.ping_interval_ms,
            idle_timeout_ms: args.idle_timeout_ms,
            session_token_ttl_ms: args.session_token_ttl_ms,
            map_width: args.map_width,
            map_height: args.map_height,
            welcome_message: args.welcome_message,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".parse().unwrap(),
        port: 0,
        metrics_addr: "127.0.0.1:9090".parse().unwrap(),
        allowed_origins: Vec::new(),
        allow_same_host_different_port: false,
        state_path: PathBuf::from("state.json"),
        poll_interval_ms: 1000,
        max_conns_ip: 10,
        max_conns: 1000,
        trust_proxy: false,
        ping_interval_ms: 15_000,
        idle_timeout_ms: 45_000,
        session_token_ttl_ms: 60_000,
        map_width: 1000.0,
        map_height: 1000.0,
        welcome_message: "hello".to_string(),
    }
}
