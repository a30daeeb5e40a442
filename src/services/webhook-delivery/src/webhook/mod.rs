//! # Webhook Delivery Pipeline
//!
//! From lifecycle event to signed HTTP call:
//! - [`registry`] owns endpoint configuration and the trigger lookup cache
//! - [`conditions`] decides whether a matched endpoint wants a particular event
//! - [`dispatcher`] creates idempotent delivery records and enqueues their jobs
//! - [`processor`] runs the bounded worker pool over the delivery queue
//! - [`worker`] executes a single attempt and records its outcome
//! - [`retry`] classifies outcomes and computes backoff
//! - [`analytics`] aggregates delivery statistics and endpoint health

pub mod analytics;
pub mod conditions;
pub mod dispatcher;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod worker;

pub use analytics::{DeliveryAnalytics, DeliveryStats, EndpointHealth, HealthThresholds, HealthVerdict};
pub use conditions::{ConditionEvaluator, ConditionTree, PredicateRegistry};
pub use dispatcher::{DispatchSummary, WebhookDispatcher};
pub use processor::{JobDisposition, JobHandler, PoolSettings, PoolStats, WorkerPool};
pub use registry::{RegistrySettings, WebhookRegistry};
pub use worker::{AlertSink, DeadLetterAlert, DeliverySettings, DeliveryWorker, LoggingAlertSink};
