use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HMAC secret used to validate identity tokens. Mandatory.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Shared coordination store for distributed rate limiting. When unset the
    /// limiter keeps its counters in process memory.
    pub redis_url: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub gateway: GatewayConfig,
    pub metrics: MetricsConfig,
}

/// Rate limiter budgets and windows.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Primary fixed window.
    pub window: Duration,
    /// Budget for guests and standard users.
    pub default_limit: u64,
    /// Budget for admins. The moderator tier gets 75% of this.
    pub admin_limit: u64,
    /// Budget for super-admins.
    pub super_admin_limit: u64,
    /// Requests allowed per burst window on sensitive paths.
    pub burst_limit: u64,
    pub burst_window: Duration,
    /// How often stale entries are swept.
    pub sweep_interval: Duration,
    /// HTTP path prefixes that are subject to the burst window.
    pub sensitive_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            default_limit: 1000,
            admin_limit: 5000,
            super_admin_limit: 10_000,
            burst_limit: 10,
            burst_window: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(300),
            sensitive_paths: vec!["/api/v1/publish".to_string(), "/admin".to_string()],
        }
    }
}

/// Connection lifecycle timings and limits.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interval between WebSocket pings.
    pub heartbeat_interval: Duration,
    /// How long a ping may go unanswered before the connection is reaped.
    pub pong_timeout: Duration,
    /// Connections without inbound traffic for this long are closed.
    pub idle_timeout: Duration,
    /// Upper bound on draining the outbound queue during close.
    pub force_close_timeout: Duration,
    /// Largest accepted inbound text frame, in bytes.
    pub max_message_bytes: usize,
    /// Per-connection outbound queue capacity.
    pub outbound_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            force_close_timeout: Duration::from_millis(2000),
            max_message_bytes: 64 * 1024,
            outbound_capacity: 256,
        }
    }
}

/// Collector cadences and history size.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub sample_interval: Duration,
    pub snapshot_interval: Duration,
    pub history_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(300),
            history_capacity: 288,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} env var is required")]
    MissingVar(&'static str),
    #[error("{name} has an invalid value: {value:?}")]
    InvalidVar { name: &'static str, value: String },
}

impl Config {
    /// Defaults for everything except the signing secret.
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            port: 4100,
            redis_url: None,
            rate_limit: RateLimitConfig::default(),
            gateway: GatewayConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing or
    /// a value cannot be parsed. A gateway without a signing secret must not
    /// start.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok()).unwrap_or_else(|e| panic!("{e}"))
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let jwt_secret = var("JWT_SECRET").ok_or(ConfigError::MissingVar("JWT_SECRET"))?;
        let mut config = Self::with_secret(jwt_secret);

        if let Some(port) = parse_var(&var, "PORT")? {
            config.port = port;
        }
        config.redis_url = var("REDIS_URL");

        let rl = &mut config.rate_limit;
        if let Some(secs) = parse_var(&var, "RATE_LIMIT_WINDOW_SECS")? {
            rl.window = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var(&var, "RATE_LIMIT_DEFAULT")? {
            rl.default_limit = v;
        }
        if let Some(v) = parse_var(&var, "RATE_LIMIT_ADMIN")? {
            rl.admin_limit = v;
        }
        if let Some(v) = parse_var(&var, "RATE_LIMIT_SUPER_ADMIN")? {
            rl.super_admin_limit = v;
        }
        if let Some(v) = parse_var(&var, "RATE_LIMIT_BURST")? {
            rl.burst_limit = v;
        }
        if let Some(secs) = parse_var(&var, "RATE_LIMIT_SWEEP_SECS")? {
            rl.sweep_interval = Duration::from_secs(secs);
        }

        let gw = &mut config.gateway;
        if let Some(secs) = parse_var(&var, "HEARTBEAT_INTERVAL_SECS")? {
            gw.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "PONG_TIMEOUT_SECS")? {
            gw.pong_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "IDLE_TIMEOUT_SECS")? {
            gw.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var(&var, "FORCE_CLOSE_TIMEOUT_MS")? {
            gw.force_close_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_var(&var, "MAX_MESSAGE_BYTES")? {
            gw.max_message_bytes = bytes;
        }

        let m = &mut config.metrics;
        if let Some(secs) = parse_var(&var, "METRICS_SAMPLE_SECS")? {
            m.sample_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "METRICS_SNAPSHOT_SECS")? {
            m.snapshot_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var(&var, "METRICS_HISTORY")? {
            m.history_capacity = n;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        None => Ok(None),
    }
}
