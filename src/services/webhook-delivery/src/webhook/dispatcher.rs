//! # Dispatcher
//!
//! Turns a lifecycle event into delivery records and queue jobs. One record per
//! (endpoint, event) pairing, keyed by an idempotency key, so dispatching the same
//! event twice never produces a second record. Failures are logged and counted but
//! never returned to the code that emitted the event.

use super::conditions::ConditionEvaluator;
use super::registry::WebhookRegistry;
use crate::metrics::WebhookMetrics;
use crate::models::{DeliveryJob, DeliveryRecord, DeliveryStatus, LifecycleEvent, WebhookEndpoint};
use crate::queue::DeliveryQueue;
use crate::security::SecurityUtils;
use crate::storage::DeliveryStore;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What happened to one lifecycle event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub event_id: String,
    pub event_type: String,
    /// Endpoints whose triggers matched
    pub matched: usize,
    /// Matched endpoints rejected by their conditions
    pub filtered: usize,
    /// Newly created delivery records
    pub created: Vec<Uuid>,
    /// Records that already existed for this event
    pub duplicates: Vec<Uuid>,
    /// Lookups or endpoints that failed and were dropped
    pub errors: usize,
}

/// Event-to-delivery dispatcher
pub struct WebhookDispatcher {
    registry: Arc<WebhookRegistry>,
    evaluator: ConditionEvaluator,
    store: Arc<dyn DeliveryStore>,
    queue: Arc<dyn DeliveryQueue>,
    metrics: WebhookMetrics,
}

impl WebhookDispatcher {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        evaluator: ConditionEvaluator,
        store: Arc<dyn DeliveryStore>,
        queue: Arc<dyn DeliveryQueue>,
        metrics: WebhookMetrics,
    ) -> Self {
        Self {
            registry,
            evaluator,
            store,
            queue,
            metrics,
        }
    }

    /// Fan a lifecycle event out to every matching endpoint
    #[instrument(
        skip(self, event),
        fields(tenant_id = %event.context.tenant_id, model = %event.model, event = %event.event)
    )]
    pub async fn on_lifecycle_event(&self, event: &LifecycleEvent) -> DispatchSummary {
        let mut summary = DispatchSummary {
            event_id: event.event_id(),
            event_type: event.event_type(),
            ..Default::default()
        };

        let endpoints = match self
            .registry
            .find_active_for_event(&event.context.tenant_id, &event.model, &event.event)
            .await
        {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(error = %e, "Endpoint lookup failed, dropping event");
                self.metrics.record_dispatch("error");
                summary.errors += 1;
                return summary;
            }
        };
        summary.matched = endpoints.len();

        for endpoint in endpoints.iter() {
            if !self.evaluator.passes(endpoint.conditions.as_ref(), event) {
                debug!(endpoint_id = %endpoint.id, "Conditions not met");
                self.metrics.record_dispatch("filtered");
                summary.filtered += 1;
                continue;
            }

            self.dispatch_to(endpoint, event, &mut summary).await;
        }

        if !summary.created.is_empty() {
            info!(
                event_type = %summary.event_type,
                created = summary.created.len(),
                duplicates = summary.duplicates.len(),
                "Dispatched lifecycle event"
            );
        }
        summary
    }

    async fn dispatch_to(
        &self,
        endpoint: &WebhookEndpoint,
        event: &LifecycleEvent,
        summary: &mut DispatchSummary,
    ) {
        let idempotency_key = SecurityUtils::idempotency_key(&endpoint.id, &summary.event_id);
        let delivery_id = Uuid::new_v4();
        let now = Utc::now();
        let record = DeliveryRecord::pending(
            endpoint,
            summary.event_type.clone(),
            idempotency_key,
            delivery_id,
            build_payload(delivery_id, endpoint, event, now),
            now,
        );

        let (record, created) = match self.store.create_if_absent(record).await {
            Ok(result) => result,
            Err(e) => {
                error!(endpoint_id = %endpoint.id, error = %e, "Failed to create delivery record");
                self.metrics.record_dispatch("error");
                summary.errors += 1;
                return;
            }
        };

        if created {
            self.metrics.record_dispatch("created");
            summary.created.push(record.id);
        } else {
            self.metrics.record_dispatch("duplicate");
            summary.duplicates.push(record.id);
            // Only a still-pending duplicate may have missed its first enqueue
            if record.status != DeliveryStatus::Pending {
                return;
            }
        }

        if let Err(e) = self
            .queue
            .enqueue(DeliveryJob::new(record.id), Duration::ZERO)
            .await
        {
            warn!(
                delivery_id = %record.id,
                endpoint_id = %endpoint.id,
                error = %e,
                "Failed to enqueue delivery; it stays pending until the event is dispatched again"
            );
            summary.errors += 1;
        }
    }
}

/// Outbound body, snapshotted once per delivery
pub fn build_payload(
    delivery_id: Uuid,
    endpoint: &WebhookEndpoint,
    event: &LifecycleEvent,
    created_at: DateTime<Utc>,
) -> Value {
    json!({
        "id": delivery_id,
        "type": event.event_type(),
        "created_at": created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "data": event.data,
        "webhook": {
            "id": endpoint.id,
            "name": endpoint.name,
        },
        "meta": {
            "tenantId": event.context.tenant_id,
            "userId": event.context.user_id,
            "requestId": event.context.request_id,
        },
    })
}
