use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Deployment environment, gates the Instance Identity startup checks (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_dev(self) -> bool {
        matches!(self, Environment::Development)
    }

    fn parse(s: &str) -> Self {
        match s {
            "staging" => Environment::Staging,
            "production" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// Defaults for the tunables below are the ones spec §6 lists under
/// "Configuration knobs".
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub environment: Environment,
    pub instance_id_override: Option<String>,

    pub lease_ttl: Duration,
    pub max_lease_ttl: Duration,
    pub max_renewals: i32,
    pub max_lease_lifetime: Duration,
    pub default_max_attempts: i32,
    pub default_retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    pub page_limit_default: i64,
    pub page_limit_max: i64,
    pub receipt_body_cap_bytes: usize,
    pub receipt_parents_cap: usize,
    pub receipt_artifacts_cap: usize,
}

impl Config {
    /// Load configuration from environment variables, following spec §6's
    /// defaults for every tunable that isn't overridden.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            environment: Environment::parse(
                &env::var("ASYNCGATE_ENV").unwrap_or_else(|_| "development".to_string()),
            ),
            instance_id_override: env::var("ASYNCGATE_INSTANCE_ID").ok(),

            lease_ttl: secs_env("ASYNCGATE_LEASE_TTL_SECS", 120)?,
            max_lease_ttl: secs_env("ASYNCGATE_MAX_LEASE_TTL_SECS", 1800)?,
            max_renewals: int_env("ASYNCGATE_MAX_RENEWALS", 10)?,
            max_lease_lifetime: secs_env("ASYNCGATE_MAX_LEASE_LIFETIME_SECS", 7200)?,
            default_max_attempts: int_env("ASYNCGATE_DEFAULT_MAX_ATTEMPTS", 2)?,
            default_retry_backoff: secs_env("ASYNCGATE_DEFAULT_RETRY_BACKOFF_SECS", 15)?,
            max_retry_backoff: secs_env("ASYNCGATE_MAX_RETRY_BACKOFF_SECS", 900)?,
            sweep_interval: secs_env("ASYNCGATE_SWEEP_INTERVAL_SECS", 5)?,
            sweep_batch_size: int64_env("ASYNCGATE_SWEEP_BATCH_SIZE", 20)?,
            page_limit_default: int64_env("ASYNCGATE_PAGE_LIMIT_DEFAULT", 50)?,
            page_limit_max: int64_env("ASYNCGATE_PAGE_LIMIT_MAX", 200)?,
            receipt_body_cap_bytes: 64 * 1024,
            receipt_parents_cap: 10,
            receipt_artifacts_cap: 100,
        })
    }
}

fn secs_env(key: &str, default_secs: u64) -> Result<Duration> {
    let raw = env::var(key).unwrap_or_else(|_| default_secs.to_string());
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer number of seconds"))?;
    Ok(Duration::from_secs(secs))
}

fn int_env(key: &str, default: i32) -> Result<i32> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{key} must be a valid integer"))
}

fn int64_env(key: &str, default: i64) -> Result<i64> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .with_context(|| format!("{key} must be a valid integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parse_defaults_to_development() {
        assert!(Environment::parse("nonsense").is_dev());
        assert!(Environment::parse("").is_dev());
    }

    #[test]
    fn environment_parse_recognizes_staging_and_production() {
        assert_eq!(Environment::parse("staging"), Environment::Staging);
        assert_eq!(Environment::parse("production"), Environment::Production);
    }
}
