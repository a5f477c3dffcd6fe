// Gateway server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The durable outbox store reads its own pool tuning vars
// (see db.rs); this module covers the core server settings.

use std::net::SocketAddr;
use std::time::Duration;

const DEV_JWT_SECRET: &str = "parley_local_development_jwt_secret_must_be_32_chars";

/// Core gateway server configuration.
///
/// Constructed via [`GatewayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for access tokens.
    pub jwt_secret: String,
    /// Server ping cadence on live connections.
    pub heartbeat_interval: Duration,
    /// Silence window after which a connection is declared dead.
    pub heartbeat_timeout: Duration,
    /// Hard ceiling on connection-attempt authentication.
    pub auth_timeout: Duration,
    /// Client reconnect attempt ceiling before the session is `Failed`.
    pub max_reconnect_attempts: u32,
    /// Outbox delivery attempts per entry before it is dropped as data loss.
    pub max_delivery_attempts: u32,
    /// Malformed frames tolerated per connection before teardown.
    pub malformed_frame_limit: u32,
    /// Whether the test-bypass identity header is honored. Never set in
    /// production; see auth::extract.
    pub test_bypass_enabled: bool,
    /// PostgreSQL connection string for the durable outbox (optional).
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `parley_gateway=debug`).
    pub log_filter: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: DEV_JWT_SECRET.into(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            max_delivery_attempts: 3,
            malformed_frame_limit: 5,
            test_bypass_enabled: false,
            database_url: None,
            cors_origins: None,
            log_filter: "info".into(),
        }
    }
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PARLEY_GATEWAY_HOST` | `0.0.0.0` |
    /// | `PARLEY_GATEWAY_PORT` | `8080` |
    /// | `PARLEY_GATEWAY_JWT_SECRET` | dev-only placeholder |
    /// | `PARLEY_GATEWAY_HEARTBEAT_INTERVAL_SECS` | `30` |
    /// | `PARLEY_GATEWAY_HEARTBEAT_TIMEOUT_SECS` | `60` |
    /// | `PARLEY_GATEWAY_AUTH_TIMEOUT_SECS` | `10` |
    /// | `PARLEY_GATEWAY_MAX_RECONNECT_ATTEMPTS` | `5` |
    /// | `PARLEY_GATEWAY_MAX_DELIVERY_ATTEMPTS` | `3` |
    /// | `PARLEY_GATEWAY_MALFORMED_FRAME_LIMIT` | `5` |
    /// | `PARLEY_GATEWAY_TEST_BYPASS` | off (`1` enables) |
    /// | `PARLEY_GATEWAY_DATABASE_URL` | *(none; in-memory outbox store)* |
    /// | `PARLEY_GATEWAY_CORS_ORIGINS` | *(none)* |
    /// | `PARLEY_GATEWAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let defaults = Self::default();

        let host = env("PARLEY_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PARLEY_GATEWAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("PARLEY_GATEWAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let secs = |key: &str, fallback: Duration| {
            env(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        let count = |key: &str, fallback: u32| {
            env(key).ok().and_then(|v| v.parse::<u32>().ok()).unwrap_or(fallback)
        };

        let heartbeat_interval =
            secs("PARLEY_GATEWAY_HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval);
        let heartbeat_timeout =
            secs("PARLEY_GATEWAY_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout);
        let auth_timeout = secs("PARLEY_GATEWAY_AUTH_TIMEOUT_SECS", defaults.auth_timeout);

        let max_reconnect_attempts =
            count("PARLEY_GATEWAY_MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts);
        let max_delivery_attempts =
            count("PARLEY_GATEWAY_MAX_DELIVERY_ATTEMPTS", defaults.max_delivery_attempts);
        let malformed_frame_limit =
            count("PARLEY_GATEWAY_MALFORMED_FRAME_LIMIT", defaults.malformed_frame_limit);

        let test_bypass_enabled = env("PARLEY_GATEWAY_TEST_BYPASS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let database_url = env("PARLEY_GATEWAY_DATABASE_URL").ok();
        let cors_origins = env("PARLEY_GATEWAY_CORS_ORIGINS").ok();
        let log_filter = env("PARLEY_GATEWAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            jwt_secret,
            heartbeat_interval,
            heartbeat_timeout,
            auth_timeout,
            max_reconnect_attempts,
            max_delivery_attempts,
            malformed_frame_limit,
            test_bypass_enabled,
            database_url,
            cors_origins,
            log_filter,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
