use std::time::Duration;

use anyhow::{Context, Result};
use edgeplane_reconcile::{DEFAULT_MAX_ATTEMPTS, DEFAULT_WORKERS};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub geo_lookup_url: String,
    pub geo_lookup_timeout: Duration,
    pub workers: usize,
    pub max_attempts: u32,
    pub notify_webhook: Option<String>,
    pub shutdown_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = var("EDGEPLANE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let geo_lookup_url = var("EDGEPLANE_GEO_LOOKUP_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8088/lookup".to_string());

        let geo_lookup_timeout = Duration::from_secs(
            parse_or(&var, "EDGEPLANE_GEO_LOOKUP_TIMEOUT_SECS", 5)?,
        );

        let workers = parse_or(&var, "EDGEPLANE_WORKERS", DEFAULT_WORKERS)?.max(1);

        let max_attempts = parse_or(&var, "EDGEPLANE_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?.max(1);

        let notify_webhook = var("EDGEPLANE_NOTIFY_WEBHOOK").filter(|v| !v.trim().is_empty());

        let shutdown_timeout = Duration::from_secs(
            parse_or(&var, "EDGEPLANE_SHUTDOWN_TIMEOUT_SECS", 10)?,
        );

        Ok(Self {
            log_level,
            geo_lookup_url,
            geo_lookup_timeout,
            workers,
            max_attempts,
            notify_webhook,
            shutdown_timeout,
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
