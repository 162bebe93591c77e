//! Configuration module for the candle feeder service.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::errors::{FeederError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Main configuration struct for the feeder.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tastytrade REST API base URL
    pub api_base_url: String,

    /// User agent sent with every request
    pub user_agent: String,

    /// Login identity
    pub username: String,

    /// Login secret; optional when a stored remember token can substitute
    pub password: Option<String>,

    /// Path of the persisted remember-token file
    pub token_file: PathBuf,

    /// Streaming endpoint URL
    pub stream_url: String,

    /// Candle symbols to subscribe to
    pub symbols: Vec<String>,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Number of buffered records that forces an eager flush
    pub batch_size: usize,

    /// Wall-clock interval between timed flushes
    pub batch_interval: Duration,

    /// Maximum records held across failed flush cycles before the oldest are dropped
    pub max_backlog: usize,

    /// Health check HTTP server port
    pub health_check_port: u16,

    /// Log level
    pub log_level: String,
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_max: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let api_base_url = env::var("TASTY_BASE_URL")
            .unwrap_or_else(|_| "https://api.tastytrade.com".to_string());
        Url::parse(&api_base_url)?;

        let stream_url = env::var("TASTY_STREAM_URL")
            .unwrap_or_else(|_| "wss://streamer.tastytrade.com".to_string());
        Url::parse(&stream_url)?;

        let symbols: Vec<String> = env::var("STREAM_SYMBOLS")
            .unwrap_or_else(|_| "SPX".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(FeederError::config("STREAM_SYMBOLS must name at least one symbol"));
        }

        Ok(Self {
            api_base_url,
            stream_url,
            symbols,

            user_agent: env::var("TASTY_USER_AGENT")
                .unwrap_or_else(|_| "tasty-feeder/0.1".to_string()),

            username: env::var("TASTY_USERNAME")
                .map_err(|_| FeederError::config("TASTY_USERNAME is required"))?,

            password: env::var("TASTY_PASSWORD").ok(),

            token_file: PathBuf::from(
                env::var("TOKEN_FILE").unwrap_or_else(|_| "tokens.json".to_string()),
            ),

            database: DatabaseConfig {
                host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("DB_PORT")
                    .unwrap_or_else(|_| "5432".to_string())
                    .parse()
                    .map_err(|_| FeederError::config("Invalid DB_PORT"))?,
                name: env::var("DB_NAME").unwrap_or_else(|_| "market_data".to_string()),
                user: env::var("DB_USER").unwrap_or_else(|_| "feeder".to_string()),
                password: env::var("DB_PASSWORD")
                    .map_err(|_| FeederError::config("DB_PASSWORD is required"))?,
                pool_max: env::var("DB_POOL_MAX")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },

            batch_size: env::var("BATCH_SIZE")
                .unwrap_or_else(|_| "500".to_string())
                .parse()
                .unwrap_or(500),

            batch_interval: Duration::from_secs(
                env::var("BATCH_INTERVAL_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),

            max_backlog: env::var("MAX_BACKLOG")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .unwrap_or(10000),

            health_check_port: env::var("HEALTH_CHECK_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| FeederError::config("Invalid HEALTH_CHECK_PORT"))?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

impl DatabaseConfig {
    /// Create a deadpool configuration.
    pub fn to_pool_config(&self) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.name.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg
    }
}
