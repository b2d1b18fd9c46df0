//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use saga::{OrchestratorConfig, RetryPolicy};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default `"0.0.0.0"`)
/// - `PORT`: listen port (default `3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `DATABASE_URL`: Postgres connection string; in-memory store when unset
/// - `SAGA_REGISTRY_PATH`: JSON registry file; built-in `create_order` when unset
/// - `SAGA_OVERALL_TIMEOUT_SECS`: deadline for a whole saga (default `3600`)
/// - `SAGA_RETRY_BASE_DELAY_MS`: backoff base (default `1000`)
/// - `SAGA_RETRY_MAX_DELAY_MS`: backoff cap (default `300000`)
/// - `SAGA_SWEEP_INTERVAL_SECS`: stuck-saga sweep period (default `30`)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub registry_path: Option<PathBuf>,
    pub overall_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key-value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            registry_path: lookup("SAGA_REGISTRY_PATH")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            overall_timeout: parse("SAGA_OVERALL_TIMEOUT_SECS")
                .map_or(defaults.overall_timeout, Duration::from_secs),
            retry_base_delay: parse("SAGA_RETRY_BASE_DELAY_MS")
                .map_or(defaults.retry_base_delay, Duration::from_millis),
            retry_max_delay: parse("SAGA_RETRY_MAX_DELAY_MS")
                .map_or(defaults.retry_max_delay, Duration::from_millis),
            // A zero period would make the sweeper spin
            sweep_interval: parse("SAGA_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map_or(defaults.sweep_interval, Duration::from_secs),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The orchestrator settings this configuration describes.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_overall_timeout(self.overall_timeout)
            .with_retry(RetryPolicy::new(self.retry_base_delay, self.retry_max_delay))
    }
}

impl Default for Config {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            registry_path: None,
            overall_timeout: orchestrator.overall_timeout,
            retry_base_delay: orchestrator.retry.base_delay,
            retry_max_delay: orchestrator.retry.max_delay,
            sweep_interval: Duration::from_secs(30),
        }
    }
}
