//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The store URL is wrapped in secrecy::SecretString since Redis URLs
//! can embed credentials.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

/// Record TTL when STATUS_TTL_SECS is not set: 24 hours.
const DEFAULT_TTL_SECS: u64 = 86_400;

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    /// Applied to every record, index, and kill-list write.
    pub status_ttl: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let ttl_secs = match std::env::var("STATUS_TTL_SECS") {
            Ok(v) => v
                .parse()
                .map_err(|_| Error::Config(format!("STATUS_TTL_SECS must be an integer, got {v}")))?,
            Err(_) => DEFAULT_TTL_SECS,
        };
        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            status_ttl: Duration::from_secs(ttl_secs),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
