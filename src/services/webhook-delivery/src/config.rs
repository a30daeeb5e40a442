//! Configuration module for the AI-CORE Webhook Delivery Service
//!
//! Values are layered: built-in defaults, then an optional file named by
//! `WEBHOOK_DELIVERY_CONFIG_FILE`, then `WEBHOOK_DELIVERY_*` environment variables
//! with `__` between nested keys (`WEBHOOK_DELIVERY_WORKER__CONCURRENCY=20`).

use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::models::{BackoffStrategy, RetryPolicy, DEFAULT_RETRY_ON_STATUS};
use crate::webhook::processor::PoolSettings;
use crate::webhook::registry::RegistrySettings;
use crate::webhook::worker::DeliverySettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "WEBHOOK_DELIVERY";

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "WEBHOOK_DELIVERY_CONFIG_FILE";

/// Main configuration structure for the Webhook Delivery Service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookDeliveryConfig {
    /// Operational HTTP server (health and metrics)
    pub server: ServerConfig,
    /// PostgreSQL stores; in-memory stores when disabled
    pub database: DatabaseConfig,
    /// Redis delivery queue; in-memory queue when disabled
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
    /// Outbound HTTP settings
    pub delivery: DeliveryConfig,
    /// Retry policy applied to endpoints registered without one
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 8085)
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    /// PostgreSQL connection URL
    pub postgres_url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
    /// Apply the bundled migrations on startup
    pub run_migrations: bool,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    /// Redis connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: usize,
    /// Key prefix for the queue's sorted sets
    pub key_prefix: String,
    /// Seconds a leased job stays invisible before it is redelivered
    pub visibility_timeout: u64,
    /// Milliseconds between polls while the queue is empty
    pub poll_interval_ms: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run the worker pool in this process
    pub enabled: bool,
    /// Maximum concurrent deliveries (default: 10)
    pub concurrency: usize,
    /// Milliseconds a single dequeue waits for a job
    pub poll_wait_ms: u64,
    /// Seconds shutdown waits for in-flight deliveries
    pub shutdown_grace: u64,
    /// Seconds after which a `processing` claim is considered abandoned
    pub stale_claim_after: u64,
    /// Seconds before a job is retried after a store or queue failure
    pub requeue_delay: u64,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds an endpoint lookup stays cached (default: 300)
    pub cache_ttl: u64,
    /// Reject plain-http endpoint URLs
    pub require_https: bool,
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-attempt timeout in seconds (default: 30)
    pub request_timeout: u64,
    pub user_agent: String,
    pub verify_tls: bool,
}

/// Default retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// `linear` or `exponential`
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retry_on_status: Vec<u16>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable metrics collection
    pub metrics_enabled: bool,
    /// Prefix of every metric name
    pub metrics_namespace: String,
    /// Metrics endpoint path (default: /metrics)
    pub metrics_path: String,
    /// Health check endpoint path (default: /health)
    pub health_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8085,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            postgres_url: "postgresql://localhost:5432/ai_core_webhooks".to_string(),
            max_connections: 10,
            connection_timeout: 30,
            run_migrations: true,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            max_connections: 10,
            key_prefix: "webhooks:".to_string(),
            visibility_timeout: 120,
            poll_interval_ms: 250,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 10,
            poll_wait_ms: 1000,
            shutdown_grace: 30,
            stale_claim_after: 90,
            requeue_delay: 5,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: 300,
            require_https: false,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            request_timeout: 30,
            user_agent: format!("AI-CORE-Webhooks/{}", env!("CARGO_PKG_VERSION")),
            verify_tls: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff_strategy: policy.backoff_strategy,
            initial_delay_ms: policy.initial_delay_ms,
            max_delay_ms: policy.max_delay_ms,
            jitter: policy.jitter,
            retry_on_status: DEFAULT_RETRY_ON_STATUS.to_vec(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_namespace: crate::metrics::DEFAULT_NAMESPACE.to_string(),
            metrics_path: "/metrics".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_strategy: self.backoff_strategy,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
            retry_on_status: self.retry_on_status.clone(),
        }
    }
}

impl WebhookDeliveryConfig {
    /// Load configuration from defaults, the optional file and the environment
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(std::env::var(CONFIG_FILE_ENV).ok().as_deref())
    }

    /// Load configuration, reading `file` (if given) between defaults and environment
    pub fn load(file: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut cfg = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = file {
            cfg = cfg.add_source(config::File::with_name(path).required(false));
        }

        cfg.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("retry.retry_on_status"),
        )
        .build()?
        .try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> WebhookDeliveryResult<()> {
        if self.server.port == 0 {
            return Err(WebhookDeliveryError::configuration("Server port cannot be 0"));
        }

        if self.database.enabled {
            let url = Url::parse(&self.database.postgres_url).map_err(|e| {
                WebhookDeliveryError::configuration(format!("Invalid PostgreSQL URL: {}", e))
            })?;
            if !matches!(url.scheme(), "postgres" | "postgresql") {
                return Err(WebhookDeliveryError::configuration(
                    "PostgreSQL URL must use the postgres:// or postgresql:// scheme",
                ));
            }
            if self.database.max_connections == 0 {
                return Err(WebhookDeliveryError::configuration(
                    "database.max_connections must be at least 1",
                ));
            }
        }

        if self.redis.enabled {
            Url::parse(&self.redis.url).map_err(|e| {
                WebhookDeliveryError::configuration(format!("Invalid Redis URL: {}", e))
            })?;
            if self.redis.visibility_timeout <= self.delivery.request_timeout {
                return Err(WebhookDeliveryError::configuration(
                    "redis.visibility_timeout must exceed delivery.request_timeout",
                ));
            }
        }

        if self.worker.concurrency == 0 {
            return Err(WebhookDeliveryError::configuration(
                "worker.concurrency must be at least 1",
            ));
        }
        if self.delivery.request_timeout == 0 {
            return Err(WebhookDeliveryError::configuration(
                "delivery.request_timeout must be at least 1 second",
            ));
        }
        if self.worker.stale_claim_after <= self.delivery.request_timeout {
            return Err(WebhookDeliveryError::configuration(
                "worker.stale_claim_after must exceed delivery.request_timeout",
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(WebhookDeliveryError::configuration(
                "retry.max_attempts must be at least 1",
            ));
        }
        if retry.initial_delay_ms == 0 || retry.initial_delay_ms > retry.max_delay_ms {
            return Err(WebhookDeliveryError::configuration(
                "retry.initial_delay_ms must be positive and not exceed retry.max_delay_ms",
            ));
        }

        Ok(())
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            concurrency: self.worker.concurrency,
            poll_wait: Duration::from_millis(self.worker.poll_wait_ms),
            shutdown_grace: Duration::from_secs(self.worker.shutdown_grace),
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            cache_ttl: Duration::from_secs(self.registry.cache_ttl),
            require_https: self.registry.require_https,
            default_retry_policy: self.retry.to_policy(),
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            request_timeout: Duration::from_secs(self.delivery.request_timeout),
            user_agent: self.delivery.user_agent.clone(),
            stale_claim_after: Duration::from_secs(self.worker.stale_claim_after),
            requeue_delay: Duration::from_secs(self.worker.requeue_delay),
            verify_tls: self.delivery.verify_tls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WebhookDeliveryConfig::default();
        assert_eq!(config.server.port, 8085);
        assert_eq!(config.worker.concurrency, 10);
        assert_eq!(config.delivery.request_timeout, 30);
        assert_eq!(config.registry.cache_ttl, 300);
        assert!(!config.database.enabled);
        assert!(!config.redis.enabled);
        assert_eq!(config.retry.to_policy(), RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = WebhookDeliveryConfig::default();

        config.server.port = 0;
        assert!(config.validate().is_err());
        config.server.port = 8085;

        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
        config.worker.concurrency = 4;

        config.database.enabled = true;
        config.database.postgres_url = "mysql://localhost/webhooks".to_string();
        assert!(config.validate().is_err());
        config.database.postgres_url = "postgres://localhost/webhooks".to_string();
        assert!(config.validate().is_ok());

        config.worker.stale_claim_after = 10;
        assert!(config.validate().is_err());
        config.worker.stale_claim_after = 90;

        config.retry.initial_delay_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let config = WebhookDeliveryConfig::default();
        assert_eq!(config.pool_settings().concurrency, 10);
        assert_eq!(
            config.delivery_settings().request_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(
            config.registry_settings().cache_ttl,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = WebhookDeliveryConfig::load(None).unwrap();
        assert_eq!(config.worker.poll_wait_ms, 1000);
        assert_eq!(config.retry.retry_on_status, DEFAULT_RETRY_ON_STATUS.to_vec());
    }
}
