//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use spendbot_queue::RateLimitConfig;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::provider::ProviderConfig;

/// Where successful job results are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultStoreKind {
    /// Results are dropped; jobs succeed without `result_ref`
    None,
    Local(PathBuf),
    /// Cloudflare R2, configured through `R2_*` variables
    R2,
}

impl ResultStoreKind {
    fn parse(kind: &str, dir: Option<String>) -> WorkerResult<Self> {
        match kind.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "local" => Ok(Self::Local(PathBuf::from(
                dir.unwrap_or_else(|| "./data".to_string()),
            ))),
            "r2" => Ok(Self::R2),
            other => Err(WorkerError::config_error(format!(
                "RESULT_STORE must be one of none, local, r2 (got {})",
                other
            ))),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops
    pub concurrency: usize,
    /// How often due retries are moved back onto the queue
    pub retry_poll_interval: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    pub provider: ProviderConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub user_ai_limit: RateLimitConfig,
    pub global_ai_limit: RateLimitConfig,
    pub result_store: ResultStoreKind,
    /// Port for the Prometheus exporter; disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            retry_poll_interval: Duration::from_millis(1000),
            shutdown_timeout: Duration::from_secs(30),
            provider: ProviderConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            user_ai_limit: RateLimitConfig::new(10, 60),
            global_ai_limit: RateLimitConfig::new(100, 60),
            result_store: ResultStoreKind::None,
            metrics_port: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            retry_poll_interval: Duration::from_millis(
                std::env::var("WORKER_RETRY_POLL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n| *n > 0)
                    .unwrap_or(1000),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            provider: ProviderConfig::from_env(),
            circuit_breaker: CircuitBreakerConfig::from_env(),
            user_ai_limit: RateLimitConfig::from_env(
                "RATE_LIMIT_USER_AI_CALLS",
                defaults.user_ai_limit,
            ),
            global_ai_limit: RateLimitConfig::from_env(
                "RATE_LIMIT_GLOBAL_AI_CALLS",
                defaults.global_ai_limit,
            ),
            result_store: ResultStoreKind::parse(
                &std::env::var("RESULT_STORE").unwrap_or_default(),
                std::env::var("RESULT_DIR").ok(),
            )?,
            metrics_port: std::env::var("METRICS_PORT").ok().and_then(|s| s.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_result_store_kind() {
        assert_eq!(ResultStoreKind::parse("", None).unwrap(), ResultStoreKind::None);
        assert_eq!(ResultStoreKind::parse("R2", None).unwrap(), ResultStoreKind::R2);
        assert_eq!(
            ResultStoreKind::parse("local", Some("/var/spendbot".to_string())).unwrap(),
            ResultStoreKind::Local(PathBuf::from("/var/spendbot"))
        );
        assert!(ResultStoreKind::parse("s3", None).is_err());
    }

    #[test]
    fn default_ai_limits() {
        let config = WorkerConfig::default();
        assert_eq!(config.user_ai_limit, RateLimitConfig::new(10, 60));
        assert_eq!(config.global_ai_limit, RateLimitConfig::new(100, 60));
        assert_eq!(config.concurrency, 2);
    }
}
