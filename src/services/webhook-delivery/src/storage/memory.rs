//! In-memory endpoint and delivery stores

use super::{ensure_attempt_bound, DeliveryStore, EndpointStore};
use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::models::{
    DeliveryAttempt, DeliveryFilter, DeliveryRecord, StatusGuard, WebhookEndpoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Endpoint store backed by a `HashMap`
#[derive(Debug, Clone, Default)]
pub struct MemoryEndpointStore {
    endpoints: Arc<RwLock<HashMap<Uuid, WebhookEndpoint>>>,
}

impl MemoryEndpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EndpointStore for MemoryEndpointStore {
    async fn insert(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&endpoint.id) {
            return Err(WebhookDeliveryError::invalid_state(format!(
                "endpoint {} already exists",
                endpoint.id
            )));
        }
        endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn update(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()> {
        let mut endpoints = self.endpoints.write();
        match endpoints.get_mut(&endpoint.id) {
            Some(stored) => {
                *stored = endpoint.clone();
                Ok(())
            }
            None => Err(WebhookDeliveryError::not_found(format!(
                "Webhook endpoint {}",
                endpoint.id
            ))),
        }
    }

    async fn delete(&self, id: Uuid) -> WebhookDeliveryResult<bool> {
        Ok(self.endpoints.write().remove(&id).is_some())
    }

    async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<WebhookEndpoint>> {
        Ok(self.endpoints.read().get(&id).cloned())
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> WebhookDeliveryResult<Vec<WebhookEndpoint>> {
        let mut endpoints: Vec<WebhookEndpoint> = self
            .endpoints
            .read()
            .values()
            .filter(|endpoint| endpoint.tenant_id == tenant_id)
            .cloned()
            .collect();
        endpoints.sort_by_key(|endpoint| endpoint.created_at);
        Ok(endpoints)
    }
}

#[derive(Debug, Default)]
struct DeliveryTables {
    records: HashMap<Uuid, DeliveryRecord>,
    by_idempotency_key: HashMap<String, Uuid>,
}

/// Delivery store backed by a `HashMap` with an idempotency-key index
#[derive(Debug, Clone, Default)]
pub struct MemoryDeliveryStore {
    tables: Arc<RwLock<DeliveryTables>>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn create_if_absent(
        &self,
        record: DeliveryRecord,
    ) -> WebhookDeliveryResult<(DeliveryRecord, bool)> {
        let mut tables = self.tables.write();

        if let Some(existing) = tables
            .by_idempotency_key
            .get(&record.idempotency_key)
            .and_then(|id| tables.records.get(id))
        {
            return Ok((existing.clone(), false));
        }

        tables
            .by_idempotency_key
            .insert(record.idempotency_key.clone(), record.id);
        tables.records.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<DeliveryRecord>> {
        Ok(self.tables.read().records.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> WebhookDeliveryResult<Option<DeliveryRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .by_idempotency_key
            .get(key)
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    async fn update_delivery_attempt(
        &self,
        id: Uuid,
        guard: &StatusGuard,
        attempt: DeliveryAttempt,
    ) -> WebhookDeliveryResult<Option<DeliveryRecord>> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .get_mut(&id)
            .ok_or_else(|| WebhookDeliveryError::not_found(format!("Delivery {}", id)))?;

        if !guard.admits(record) {
            return Ok(None);
        }
        ensure_attempt_bound(id, record.max_attempts, &attempt)?;

        record.apply(attempt);
        Ok(Some(record.clone()))
    }

    async fn list(&self, filter: &DeliveryFilter) -> WebhookDeliveryResult<Vec<DeliveryRecord>> {
        let mut records: Vec<DeliveryRecord> = self
            .tables
            .read()
            .records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> WebhookDeliveryResult<u64> {
        let mut tables = self.tables.write();
        let expired: Vec<(Uuid, String)> = tables
            .records
            .values()
            .filter(|record| {
                record.status.is_terminal()
                    && record.completed_at.map_or(false, |at| at < cutoff)
            })
            .map(|record| (record.id, record.idempotency_key.clone()))
            .collect();

        for (id, key) in &expired {
            tables.records.remove(id);
            tables.by_idempotency_key.remove(key);
        }
        Ok(expired.len() as u64)
    }
}
