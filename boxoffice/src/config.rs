//! Configuration for the allocation core and its sweeper service.
//!
//! Values are layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. YAML file (`-f`, `BOXOFFICE_CONFIG`, default `config.yaml`)
//! 3. `BOXOFFICE_` prefixed environment variables, `__` separating nested keys
//!    (e.g. `BOXOFFICE_HOLDS__DEFAULT_TTL=5m`)
//! 4. `DATABASE_URL`
//!
//! Durations use humantime syntax (`30s`, `10m`, `365days`).

use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "BOXOFFICE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the sweeper.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Set from the `DATABASE_URL` environment variable; replaces `database.url` when present.
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    pub database: DatabaseConfig,
    pub holds: HoldsConfig,
    pub sweeper: SweeperConfig,
    pub retry: RetryConfig,
    pub tickets: TicketsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool: PoolSettings,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds, 0 = never)
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection (seconds, 0 = never)
    pub max_lifetime_secs: u64,
}

/// Seat hold lifetimes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HoldsConfig {
    /// TTL used when the caller does not ask for one
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Requested TTLs are raised to at least this
    #[serde(with = "humantime_serde")]
    pub min_ttl: Duration,
    /// Requested TTLs are capped at this
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Time between sweeps of expired holds
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Bounded retry of single atomic store steps on transient failures.
///
/// Attempt `n` (0-based) waits `backoff_ms * backoff_factor^n`, capped at `max_backoff_ms`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first; 1 disables retries
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TicketsConfig {
    /// HMAC key for ticket validation tokens. Required to issue or validate tickets.
    pub secret_key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Currency recorded on orders
    pub currency: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            database: DatabaseConfig::default(),
            holds: HoldsConfig::default(),
            sweeper: SweeperConfig::default(),
            retry: RetryConfig::default(),
            tickets: TicketsConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/boxoffice".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

impl Default for PoolSettings {
    /// Production defaults: balanced for reliability and resource usage
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,  // 10 minutes
            max_lifetime_secs: 1800, // 30 minutes
        }
    }
}

impl Default for HoldsConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(10 * 60),
            min_ttl: Duration::from_secs(1),
            max_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 20,
            backoff_factor: 2,
            max_backoff_ms: 500,
        }
    }
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            token_ttl: Duration::from_secs(365 * 24 * 60 * 60),
            currency: "USD".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the file named in `args`, environment overrides and `DATABASE_URL`.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        if let Some(url) = config.database_url.take() {
            config.database.url = url;
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("BOXOFFICE_").ignore(&["config"]).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let holds = &self.holds;
        if holds.min_ttl.is_zero() {
            return Err(invalid("holds.min_ttl must be greater than zero"));
        }
        if holds.min_ttl > holds.default_ttl || holds.default_ttl > holds.max_ttl {
            return Err(invalid("holds TTLs must satisfy min_ttl <= default_ttl <= max_ttl"));
        }
        if self.sweeper.interval.is_zero() {
            return Err(invalid("sweeper.interval must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_factor == 0 {
            return Err(invalid("retry.backoff_factor must be at least 1"));
        }
        if let Some(secret) = &self.tickets.secret_key
            && secret.len() < 16
        {
            return Err(invalid(
                "tickets.secret_key must be at least 16 bytes. Set BOXOFFICE_TICKETS__SECRET_KEY or add it to the config file.",
            ));
        }
        if self.tickets.token_ttl.is_zero() {
            return Err(invalid("tickets.token_ttl must be greater than zero"));
        }
        if self.tickets.currency.trim().is_empty() {
            return Err(invalid("tickets.currency must not be empty"));
        }
        if self.database.pool.max_connections == 0 || self.database.pool.min_connections > self.database.pool.max_connections {
            return Err(invalid("database.pool must allow at least one connection and min_connections <= max_connections"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidInput {
        message: format!("Config validation: {message}"),
    }
}
