//! # Storage
//!
//! Persistence contracts for webhook endpoints and delivery records, with an
//! in-memory backend for tests and single-process use and a PostgreSQL backend.
//!
//! Every delivery state transition goes through
//! [`DeliveryStore::update_delivery_attempt`], a compare-and-swap guarded by the
//! record's current status. That guard is what keeps two workers from attempting
//! the same record concurrently.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryDeliveryStore, MemoryEndpointStore};
pub use postgres::{PostgresDeliveryStore, PostgresEndpointStore};

use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::models::{
    DeliveryAttempt, DeliveryFilter, DeliveryRecord, StatusGuard, WebhookEndpoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Storage for webhook endpoint configuration
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn insert(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()>;

    /// Replace a stored endpoint; `NotFound` if it does not exist
    async fn update(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()>;

    /// Returns whether an endpoint was removed
    async fn delete(&self, id: Uuid) -> WebhookDeliveryResult<bool>;

    async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<WebhookEndpoint>>;

    async fn list_by_tenant(&self, tenant_id: &str) -> WebhookDeliveryResult<Vec<WebhookEndpoint>>;
}

/// Storage for delivery records
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert `record` unless its idempotency key already exists.
    ///
    /// Returns the stored record and whether it was created by this call.
    async fn create_if_absent(
        &self,
        record: DeliveryRecord,
    ) -> WebhookDeliveryResult<(DeliveryRecord, bool)>;

    async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<DeliveryRecord>>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> WebhookDeliveryResult<Option<DeliveryRecord>>;

    /// Apply `attempt` if the stored record satisfies `guard`.
    ///
    /// Returns `Ok(None)` when the guard rejects the write, `NotFound` when the record
    /// is missing and `InvalidState` when the attempt count would exceed the maximum.
    async fn update_delivery_attempt(
        &self,
        id: Uuid,
        guard: &StatusGuard,
        attempt: DeliveryAttempt,
    ) -> WebhookDeliveryResult<Option<DeliveryRecord>>;

    /// Records matching `filter`, newest first
    async fn list(&self, filter: &DeliveryFilter) -> WebhookDeliveryResult<Vec<DeliveryRecord>>;

    /// Delete terminal records completed before `cutoff`; returns how many were removed
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> WebhookDeliveryResult<u64>;
}

pub(crate) fn ensure_attempt_bound(
    id: Uuid,
    max_attempts: u32,
    attempt: &DeliveryAttempt,
) -> WebhookDeliveryResult<()> {
    if attempt.attempt_count > max_attempts {
        return Err(WebhookDeliveryError::invalid_state(format!(
            "delivery {} would reach {} attempts, maximum is {}",
            id, attempt.attempt_count, max_attempts
        )));
    }
    Ok(())
}
