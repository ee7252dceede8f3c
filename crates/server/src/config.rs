//! Server configuration from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Which backend holds users, messages and notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMode {
    /// Aurora document database at the given path.
    Aurora { path: String },
    /// Process-local maps. Nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub store: StoreMode,
    pub cors_origins: Vec<String>,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub fanout_batch: usize,
    pub json_logs: bool,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `KINSHIP_BIND_ADDR`: listen address (default: "0.0.0.0:5000")
    /// - `KINSHIP_JWT_SECRET`: HS256 secret for access tokens (required)
    /// - `KINSHIP_STORE`: "aurora" | "memory" (default: "aurora")
    /// - `KINSHIP_DB_PATH`: aurora data directory (default: "kinship_db_data")
    /// - `KINSHIP_CORS_ORIGINS`: comma-separated origins, "*" for any (default: "*")
    /// - `KINSHIP_PING_INTERVAL_SECS` (default: 25), `KINSHIP_PONG_TIMEOUT_SECS` (default: 60)
    /// - `KINSHIP_FANOUT_BATCH`: recipients per dispatch batch (default: 256)
    /// - `KINSHIP_JSON_LOGS`: "true" for JSON log lines (default: false)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("KINSHIP_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:5000".to_string())
            .parse()
            .context("KINSHIP_BIND_ADDR must be a socket address")?;

        let jwt_secret = match lookup("KINSHIP_JWT_SECRET") {
            Some(secret) if !secret.trim().is_empty() => secret,
            _ => bail!("KINSHIP_JWT_SECRET is required"),
        };

        let store = match lookup("KINSHIP_STORE")
            .unwrap_or_else(|| "aurora".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StoreMode::Memory,
            "aurora" => StoreMode::Aurora {
                path: lookup("KINSHIP_DB_PATH").unwrap_or_else(|| "kinship_db_data".to_string()),
            },
            other => bail!("unknown KINSHIP_STORE `{other}` (expected aurora or memory)"),
        };

        let cors_origins = lookup("KINSHIP_CORS_ORIGINS")
            .unwrap_or_else(|| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let ping_secs: u64 = parse_or(&lookup, "KINSHIP_PING_INTERVAL_SECS", 25)?;
        if ping_secs == 0 {
            bail!("KINSHIP_PING_INTERVAL_SECS must be at least 1");
        }
        let pong_secs: u64 = parse_or(&lookup, "KINSHIP_PONG_TIMEOUT_SECS", 60)?;
        if pong_secs == 0 {
            bail!("KINSHIP_PONG_TIMEOUT_SECS must be at least 1");
        }
        let ping_interval = Duration::from_secs(ping_secs);
        let pong_timeout = Duration::from_secs(pong_secs);

        let fanout_batch = parse_or(&lookup, "KINSHIP_FANOUT_BATCH", 256)?;
        if fanout_batch == 0 {
            bail!("KINSHIP_FANOUT_BATCH must be at least 1");
        }

        let json_logs = lookup("KINSHIP_JSON_LOGS")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            bind_addr,
            jwt_secret,
            store,
            cors_origins,
            ping_interval,
            pong_timeout,
            fanout_batch,
            json_logs,
        })
    }

    /// Defaults suitable for tests: in-memory store, fixed secret.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            jwt_secret: jwt_secret.to_string(),
            store: StoreMode::Memory,
            cors_origins: vec!["*".to_string()],
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(60),
            fanout_batch: 256,
            json_logs: false,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value `{raw}`")),
        None => Ok(default),
    }
}
