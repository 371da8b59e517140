// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. CORS origins are read here but interpreted by cors.rs.

use std::{net::SocketAddr, time::Duration};

const DEV_JWT_SECRET: &str = "courier_local_development_jwt_secret_must_be_32_chars";

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 65_536;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with whatever issues access tokens.
    pub jwt_secret: String,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `courier_relay=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines instead of the human formatter.
    pub log_json: bool,
    /// Upper bound on a single relayed send to one recipient connection.
    pub send_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// Largest inbound WebSocket frame accepted.
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COURIER_RELAY_HOST` | `0.0.0.0` |
    /// | `COURIER_RELAY_PORT` | `8000` |
    /// | `COURIER_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `COURIER_RELAY_CORS_ORIGINS` | *(none: cors.rs uses dev defaults)* |
    /// | `COURIER_RELAY_LOG_FILTER` | `info` |
    /// | `COURIER_RELAY_LOG_JSON` | `false` |
    /// | `COURIER_RELAY_SEND_TIMEOUT_MS` | `2000` |
    /// | `COURIER_RELAY_OUTBOUND_QUEUE` | `256` |
    /// | `COURIER_RELAY_MAX_FRAME_BYTES` | `65536` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COURIER_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_positive(&env, "COURIER_RELAY_PORT").unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("COURIER_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let cors_origins = env("COURIER_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("COURIER_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("COURIER_RELAY_LOG_JSON")
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        let send_timeout = Duration::from_millis(
            parse_positive(&env, "COURIER_RELAY_SEND_TIMEOUT_MS")
                .unwrap_or(DEFAULT_SEND_TIMEOUT_MS),
        );
        let outbound_queue =
            parse_positive(&env, "COURIER_RELAY_OUTBOUND_QUEUE").unwrap_or(DEFAULT_OUTBOUND_QUEUE);
        let max_frame_bytes = parse_positive(&env, "COURIER_RELAY_MAX_FRAME_BYTES")
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        Self {
            listen_addr,
            jwt_secret,
            cors_origins,
            log_filter,
            log_json,
            send_timeout,
            outbound_queue,
            max_frame_bytes,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_positive<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr + PartialOrd + Default,
{
    env(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}
