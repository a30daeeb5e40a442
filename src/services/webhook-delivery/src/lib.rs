//! # AI-CORE Webhook Delivery Service
//!
//! Turns internal lifecycle events into signed HTTP notifications to
//! tenant-configured endpoints, with conditional triggering, retry with backoff,
//! and dead-lettering.
//!
//! ## Features
//!
//! - **Registry**: validated endpoint configuration with a cached trigger lookup
//! - **Conditions**: field/role/tenant/time/custom predicates composed with and/or/not
//! - **Dispatch**: one idempotent delivery record per (endpoint, event)
//! - **Delivery**: HMAC-SHA256 signed requests, guarded state transitions, delayed retries
//! - **Analytics**: success rate, latency percentiles, top errors and endpoint health
//! - **Backends**: in-memory or PostgreSQL stores, in-memory or Redis queue
//!
//! ## Usage
//!
//! ```rust,no_run
//! use webhook_delivery_service::{WebhookDeliveryConfig, WebhookService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WebhookDeliveryConfig::from_env()?;
//!     let service = WebhookService::new(config).await?;
//!     service.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod security;
pub mod service;
pub mod storage;
pub mod utils;
pub mod webhook;

// Re-export main types for easier usage
pub use config::WebhookDeliveryConfig;
pub use error::{WebhookDeliveryError, WebhookDeliveryResult};
pub use models::{
    DeliveryFilter, DeliveryRecord, DeliveryStatus, EventContext, LifecycleEvent,
    NewWebhookEndpoint, RetryPolicy, WebhookEndpoint, WebhookEndpointPatch,
};
pub use security::SecurityUtils;
pub use service::{EndpointTestResult, HealthReport, ServiceBackends, WebhookService};
pub use webhook::{
    AlertSink, ConditionTree, DeadLetterAlert, DispatchSummary, PredicateRegistry,
};

/// Version information for the webhook delivery service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "webhook-delivery-service";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
        assert_eq!(SERVICE_NAME, "webhook-delivery-service");
    }
}
