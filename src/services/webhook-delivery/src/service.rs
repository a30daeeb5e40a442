//! Main service implementation for the AI-CORE Webhook Delivery Service
//!
//! [`WebhookService`] wires the registry, dispatcher, delivery worker, worker pool
//! and analytics over a set of storage and queue backends, and exposes the admin
//! operations as a library facade. [`WebhookService::start`] runs the worker pool
//! next to the operational HTTP server until a shutdown signal arrives.

use crate::config::WebhookDeliveryConfig;
use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::handlers::create_routes;
use crate::metrics::WebhookMetrics;
use crate::models::{
    DeliveryFilter, DeliveryJob, DeliveryRecord, DeliveryStatus, EventContext, LifecycleEvent,
    NewWebhookEndpoint, StatusGuard, WebhookEndpoint, WebhookEndpointPatch,
};
use crate::queue::{DeliveryQueue, MemoryDeliveryQueue, QueueDepth, RedisDeliveryQueue};
use crate::storage::{
    postgres, DeliveryStore, EndpointStore, MemoryDeliveryStore, MemoryEndpointStore,
    PostgresDeliveryStore, PostgresEndpointStore,
};
use crate::webhook::analytics::{DeliveryAnalytics, DeliveryStats, EndpointHealth, HealthThresholds};
use crate::webhook::conditions::{ConditionEvaluator, PredicateRegistry};
use crate::webhook::dispatcher::{build_payload, DispatchSummary, WebhookDispatcher};
use crate::webhook::processor::{PoolStats, WorkerPool};
use crate::webhook::registry::WebhookRegistry;
use crate::webhook::worker::{AlertSink, DeliveryWorker, LoggingAlertSink};
use axum::serve;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Event type carried by test deliveries
pub const TEST_EVENT_TYPE: &str = "webhook.test";

/// Storage, queue and alerting collaborators of a [`WebhookService`]
#[derive(Clone)]
pub struct ServiceBackends {
    pub endpoints: Arc<dyn EndpointStore>,
    pub deliveries: Arc<dyn DeliveryStore>,
    pub queue: Arc<dyn DeliveryQueue>,
    pub alerts: Arc<dyn AlertSink>,
    pub predicates: PredicateRegistry,
    pub db_pool: Option<sqlx::PgPool>,
    pub redis_pool: Option<deadpool_redis::Pool>,
}

impl ServiceBackends {
    /// In-process stores and queue
    pub fn in_memory() -> Self {
        Self {
            endpoints: Arc::new(MemoryEndpointStore::new()),
            deliveries: Arc::new(MemoryDeliveryStore::new()),
            queue: Arc::new(MemoryDeliveryQueue::default()),
            alerts: Arc::new(LoggingAlertSink),
            predicates: PredicateRegistry::new(),
            db_pool: None,
            redis_pool: None,
        }
    }

    /// Backends selected by `config`: PostgreSQL stores and a Redis queue when enabled
    pub async fn from_config(config: &WebhookDeliveryConfig) -> WebhookDeliveryResult<Self> {
        let mut backends = Self::in_memory();

        if config.database.enabled {
            let pool = create_db_pool(config).await?;
            if config.database.run_migrations {
                postgres::run_migrations(&pool).await?;
            }
            backends.endpoints = Arc::new(PostgresEndpointStore::new(pool.clone()));
            backends.deliveries = Arc::new(PostgresDeliveryStore::new(pool.clone()));
            backends.db_pool = Some(pool);
            info!("PostgreSQL stores initialized");
        } else {
            warn!("Database disabled, endpoints and deliveries are kept in memory");
        }

        if config.redis.enabled {
            let pool = create_redis_pool(config).await?;
            backends.queue = Arc::new(RedisDeliveryQueue::new(
                pool.clone(),
                &config.redis.key_prefix,
                Duration::from_secs(config.redis.visibility_timeout),
                Duration::from_millis(config.redis.poll_interval_ms),
            ));
            backends.redis_pool = Some(pool);
            info!("Redis delivery queue initialized");
        } else {
            warn!("Redis disabled, the delivery queue is in memory");
        }

        Ok(backends)
    }
}

/// Overall service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one backing system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn from_result(result: WebhookDeliveryResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                healthy: true,
                error: None,
            },
            Err(e) => Self {
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub service: String,
    pub version: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<ComponentHealth>,
    pub queue: Option<QueueDepth>,
    pub workers: PoolStats,
    pub uptime_seconds: i64,
    pub timestamp: DateTime<Utc>,
}

/// Result of a one-off signed test request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTestResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

/// Custom request ID generator
#[derive(Clone, Default)]
struct WebhookRequestId;

impl MakeRequestId for WebhookRequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = format!("req-{}", Uuid::new_v4());
        axum::http::HeaderValue::from_str(&id)
            .ok()
            .map(RequestId::new)
    }
}

/// Webhook delivery service
pub struct WebhookService {
    config: WebhookDeliveryConfig,
    registry: Arc<WebhookRegistry>,
    predicates: PredicateRegistry,
    dispatcher: WebhookDispatcher,
    worker: Arc<DeliveryWorker>,
    pool: WorkerPool,
    deliveries: Arc<dyn DeliveryStore>,
    queue: Arc<dyn DeliveryQueue>,
    analytics: DeliveryAnalytics,
    metrics: WebhookMetrics,
    db_pool: Option<sqlx::PgPool>,
    redis_pool: Option<deadpool_redis::Pool>,
    started_at: DateTime<Utc>,
}

impl WebhookService {
    /// Create a service with the backends `config` selects
    pub async fn new(config: WebhookDeliveryConfig) -> WebhookDeliveryResult<Self> {
        info!("Initializing AI-CORE Webhook Delivery Service");
        config.validate()?;
        let backends = ServiceBackends::from_config(&config).await?;
        Self::with_backends(config, backends)
    }

    /// Create a service over explicit backends
    pub fn with_backends(
        config: WebhookDeliveryConfig,
        backends: ServiceBackends,
    ) -> WebhookDeliveryResult<Self> {
        let metrics = WebhookMetrics::new(&config.observability.metrics_namespace)?;
        let registry = Arc::new(WebhookRegistry::new(
            backends.endpoints,
            config.registry_settings(),
        ));

        let dispatcher = WebhookDispatcher::new(
            registry.clone(),
            ConditionEvaluator::new(backends.predicates.clone()),
            backends.deliveries.clone(),
            backends.queue.clone(),
            metrics.clone(),
        );

        let worker = Arc::new(DeliveryWorker::new(
            backends.deliveries.clone(),
            registry.clone(),
            backends.queue.clone(),
            backends.alerts,
            metrics.clone(),
            config.delivery_settings(),
        )?);

        let pool = WorkerPool::new(
            backends.queue.clone(),
            worker.clone(),
            config.pool_settings(),
            metrics.clone(),
        );

        let analytics = DeliveryAnalytics::new(backends.deliveries.clone(), HealthThresholds::default());

        Ok(Self {
            config,
            registry,
            predicates: backends.predicates,
            dispatcher,
            worker,
            pool,
            deliveries: backends.deliveries,
            queue: backends.queue,
            analytics,
            metrics,
            db_pool: backends.db_pool,
            redis_pool: backends.redis_pool,
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &WebhookDeliveryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &WebhookMetrics {
        &self.metrics
    }

    /// Named predicates available to `custom` conditions
    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn worker(&self) -> &DeliveryWorker {
        &self.worker
    }

    /// Entry point for the business layer; never fails
    pub async fn on_lifecycle_event(&self, event: &LifecycleEvent) -> DispatchSummary {
        self.dispatcher.on_lifecycle_event(event).await
    }

    pub async fn create_endpoint(
        &self,
        config: NewWebhookEndpoint,
    ) -> WebhookDeliveryResult<WebhookEndpoint> {
        self.registry.register(config).await
    }

    pub async fn update_endpoint(
        &self,
        id: Uuid,
        patch: WebhookEndpointPatch,
    ) -> WebhookDeliveryResult<WebhookEndpoint> {
        self.registry.update(id, patch).await
    }

    pub async fn delete_endpoint(&self, id: Uuid) -> WebhookDeliveryResult<()> {
        self.registry.delete(id).await
    }

    pub async fn deactivate_endpoint(&self, id: Uuid) -> WebhookDeliveryResult<WebhookEndpoint> {
        self.registry.deactivate(id).await
    }

    pub async fn rotate_secret(&self, id: Uuid) -> WebhookDeliveryResult<WebhookEndpoint> {
        self.registry.rotate_secret(id).await
    }

    pub async fn get_endpoint(&self, id: Uuid) -> WebhookDeliveryResult<WebhookEndpoint> {
        self.registry
            .get(id)
            .await?
            .ok_or_else(|| WebhookDeliveryError::not_found(format!("Webhook endpoint {}", id)))
    }

    pub async fn list_endpoints(&self, tenant_id: &str) -> WebhookDeliveryResult<Vec<WebhookEndpoint>> {
        self.registry.list(tenant_id).await
    }

    /// Send a signed `webhook.test` request to the endpoint; no delivery record is created
    #[instrument(skip(self), fields(endpoint_id = %id))]
    pub async fn test_endpoint(&self, id: Uuid) -> WebhookDeliveryResult<EndpointTestResult> {
        let endpoint = self.get_endpoint(id).await?;
        let now = Utc::now();
        let delivery_id = Uuid::new_v4();

        let event = LifecycleEvent {
            id: Some(delivery_id.to_string()),
            event: "test".to_string(),
            model: "webhook".to_string(),
            data: json!({ "message": "This is a test delivery" }),
            previous: None,
            context: EventContext {
                tenant_id: endpoint.tenant_id.clone(),
                user_id: None,
                user_role: None,
                request_id: format!("test-{}", delivery_id),
                timestamp: now,
                source: "admin".to_string(),
            },
        };
        let body = serde_json::to_vec(&build_payload(delivery_id, &endpoint, &event, now))?;

        let attempt = self
            .worker
            .send_signed(&endpoint, delivery_id, TEST_EVENT_TYPE, body)
            .await;
        let success = attempt.status.map_or(false, |status| (200..300).contains(&status));
        info!(success, status_code = ?attempt.status, "Test delivery sent");

        Ok(EndpointTestResult {
            success,
            status_code: attempt.status,
            response_time_ms: attempt.response_time_ms(),
            response_body: attempt.body,
            error: attempt.error,
        })
    }

    pub async fn get_delivery(&self, id: Uuid) -> WebhookDeliveryResult<DeliveryRecord> {
        self.deliveries
            .get(id)
            .await?
            .ok_or_else(|| WebhookDeliveryError::not_found(format!("Delivery {}", id)))
    }

    /// Deliveries for an endpoint, newest first
    pub async fn list_deliveries(
        &self,
        endpoint_id: Uuid,
        limit: Option<usize>,
    ) -> WebhookDeliveryResult<Vec<DeliveryRecord>> {
        let filter = DeliveryFilter {
            limit,
            ..DeliveryFilter::for_endpoint(endpoint_id)
        };
        self.deliveries.list(&filter).await
    }

    pub async fn search_deliveries(
        &self,
        filter: &DeliveryFilter,
    ) -> WebhookDeliveryResult<Vec<DeliveryRecord>> {
        self.deliveries.list(filter).await
    }

    /// Put a `failed` or `dead_letter` delivery back in the queue with a fresh attempt budget
    #[instrument(skip(self), fields(delivery_id = %id))]
    pub async fn retry_delivery(&self, id: Uuid) -> WebhookDeliveryResult<DeliveryRecord> {
        let record = self.get_delivery(id).await?;
        if !matches!(record.status, DeliveryStatus::Failed | DeliveryStatus::DeadLetter) {
            return Err(WebhookDeliveryError::invalid_state(format!(
                "delivery {} is {} and cannot be retried",
                id, record.status
            )));
        }

        let mut reset = record.attempt_state();
        reset.status = DeliveryStatus::Pending;
        reset.attempt_count = 0;
        reset.next_attempt_at = Some(Utc::now());
        reset.completed_at = None;
        reset.response_status = None;
        reset.response_body = None;
        reset.response_time_ms = None;
        reset.error_message = None;

        let guard = StatusGuard {
            attempt_count: Some(record.attempt_count),
            ..StatusGuard::expecting(&[record.status])
        };
        let updated = self
            .deliveries
            .update_delivery_attempt(id, &guard, reset)
            .await?
            .ok_or_else(|| {
                WebhookDeliveryError::invalid_state(format!("delivery {} changed concurrently", id))
            })?;

        if let Err(e) = self.queue.enqueue(DeliveryJob::new(id), Duration::ZERO).await {
            self.restore_after_failed_retry(&record).await;
            return Err(e);
        }
        info!(previous_status = %record.status, "Delivery requeued by admin");
        Ok(updated)
    }

    /// Undo an admin reset whose job never reached the queue
    async fn restore_after_failed_retry(&self, observed: &DeliveryRecord) {
        let guard = StatusGuard {
            attempt_count: Some(0),
            ..StatusGuard::expecting(&[DeliveryStatus::Pending])
        };
        match self
            .deliveries
            .update_delivery_attempt(observed.id, &guard, observed.attempt_state())
            .await
        {
            Ok(Some(_)) => warn!(
                delivery_id = %observed.id,
                status = %observed.status,
                "Enqueue failed, delivery restored"
            ),
            Ok(None) => warn!(
                delivery_id = %observed.id,
                "Enqueue failed and the delivery changed before it could be restored"
            ),
            Err(e) => error!(
                delivery_id = %observed.id,
                error = %e,
                "Enqueue failed and the delivery could not be restored"
            ),
        }
    }

    pub async fn delivery_stats(&self, filter: &DeliveryFilter) -> WebhookDeliveryResult<DeliveryStats> {
        self.analytics.get_delivery_stats(filter).await
    }

    pub async fn endpoint_health(
        &self,
        endpoint_id: Uuid,
        window: Duration,
    ) -> WebhookDeliveryResult<EndpointHealth> {
        self.analytics.get_endpoint_health(endpoint_id, window).await
    }

    /// Remove finished deliveries completed before `cutoff`
    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> WebhookDeliveryResult<u64> {
        let purged = self.deliveries.purge_terminal_before(cutoff).await?;
        info!(purged, cutoff = %cutoff, "Purged finished deliveries");
        Ok(purged)
    }

    /// Probe the backing systems
    pub async fn health(&self) -> HealthReport {
        let database = match &self.db_pool {
            Some(pool) => Some(ComponentHealth::from_result(
                sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(WebhookDeliveryError::from),
            )),
            None => None,
        };

        let redis = match &self.redis_pool {
            Some(pool) => Some(ComponentHealth::from_result(ping_redis(pool).await)),
            None => None,
        };

        let queue = match self.queue.depth().await {
            Ok(depth) => {
                self.metrics.set_queue_depth(depth);
                Some(depth)
            }
            Err(e) => {
                warn!(error = %e, "Queue depth unavailable");
                None
            }
        };

        let workers = self.pool.stats();
        let backends_up = database.as_ref().map_or(true, |c| c.healthy)
            && redis.as_ref().map_or(true, |c| c.healthy)
            && queue.is_some();
        let status = if !backends_up {
            ServiceStatus::Unhealthy
        } else if self.config.worker.enabled && !workers.running {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Healthy
        };

        HealthReport {
            service: crate::SERVICE_NAME.to_string(),
            version: crate::VERSION.to_string(),
            status,
            database,
            redis,
            queue,
            workers,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            timestamp: Utc::now(),
        }
    }

    /// Run the worker pool and the operational HTTP server until shutdown
    pub async fn start(self) -> WebhookDeliveryResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| {
                WebhookDeliveryError::configuration(format!("Invalid server address: {}", e))
            })?;

        let service = Arc::new(self);
        let shutdown = CancellationToken::new();

        let workers = if service.config.worker.enabled {
            let pool = service.pool.clone();
            let token = shutdown.child_token();
            Some(tokio::spawn(async move { pool.run(token).await }))
        } else {
            info!("Worker pool disabled in this process");
            None
        };

        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(WebhookRequestId))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id());
        let app = create_routes(service.clone()).layer(middleware);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            WebhookDeliveryError::internal(format!("Failed to bind to address: {}", e))
        })?;
        info!("Webhook delivery service listening on {}", addr);

        let server_shutdown = shutdown.clone();
        let served = serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = server_shutdown.cancelled() => {}
                }
            })
            .await;

        shutdown.cancel();
        if let Some(handle) = workers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Worker pool stopped with an error"),
                Err(e) => error!(error = %e, "Worker pool task failed"),
            }
        }

        served.map_err(|e| {
            error!("Server error: {}", e);
            WebhookDeliveryError::internal(format!("Server error: {}", e))
        })?;

        info!("Webhook delivery service stopped gracefully");
        Ok(())
    }
}

/// Create Redis connection pool
pub async fn create_redis_pool(
    config: &WebhookDeliveryConfig,
) -> WebhookDeliveryResult<deadpool_redis::Pool> {
    let mut redis_config = deadpool_redis::Config::from_url(&config.redis.url);
    redis_config.pool = Some(deadpool_redis::PoolConfig::new(config.redis.max_connections));
    let pool = redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| {
            WebhookDeliveryError::configuration(format!("Redis pool creation failed: {}", e))
        })?;

    ping_redis(&pool).await.map_err(|e| {
        WebhookDeliveryError::configuration(format!("Redis connection test failed: {}", e))
    })?;
    Ok(pool)
}

/// Create database connection pool
pub async fn create_db_pool(config: &WebhookDeliveryConfig) -> WebhookDeliveryResult<sqlx::PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connection_timeout))
        .connect(&config.database.postgres_url)
        .await
        .map_err(|e| {
            WebhookDeliveryError::configuration(format!("Database connection failed: {}", e))
        })?;

    sqlx::query("SELECT 1").execute(&pool).await.map_err(|e| {
        WebhookDeliveryError::configuration(format!("Database test query failed: {}", e))
    })?;

    Ok(pool)
}

async fn ping_redis(pool: &deadpool_redis::Pool) -> WebhookDeliveryResult<()> {
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
