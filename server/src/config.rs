//! Configuration management for the server.

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Coordination store connection URL (Redis-compatible)
    pub redis_url: String,
    /// Document cache connection URL (MongoDB)
    pub mongo_url: String,
    /// Document cache database name
    pub mongo_db: String,
    /// Secret key for token validation (absent means anonymous/dev mode)
    pub auth_secret: Option<String>,
    /// How long a hot anchor cache may sit untouched before it's eligible
    /// for cooling
    pub cache_ttl: Duration,
    /// How often the expiry sweeper scans for stale anchors
    pub sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let redis_url = env::var("REDIS_URL").map_err(|_| ConfigError::MissingRedisUrl)?;
        let mongo_url = env::var("MONGO_URL").map_err(|_| ConfigError::MissingMongoUrl)?;
        let mongo_db = env::var("MONGO_DB").unwrap_or_else(|_| "anchor_sync".to_string());

        let auth_secret = env::var("AUTH_SECRET").ok();

        let cache_ttl = Duration::from_secs(
            env::var("CACHE_TTL_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidDuration("CACHE_TTL_SECS"))?,
        );

        let sweep_interval = Duration::from_secs(
            env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidDuration("SWEEP_INTERVAL_SECS"))?,
        );

        Ok(Self {
            host,
            port,
            redis_url,
            mongo_url,
            mongo_db,
            auth_secret,
            cache_ttl,
            sweep_interval,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("REDIS_URL environment variable is required")]
    MissingRedisUrl,

    #[error("MONGO_URL environment variable is required")]
    MissingMongoUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid duration for {0}")]
    InvalidDuration(&'static str),
}
