//! # Delivery Queue
//!
//! At-least-once job queue with delayed scheduling. A dequeued job is leased for a
//! visibility timeout; a lease that is neither acked nor nacked before it expires
//! becomes visible again. Jobs carry only the delivery id, the delivery record in
//! the store remains the source of truth.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryDeliveryQueue;
pub use self::redis::RedisDeliveryQueue;

use crate::error::WebhookDeliveryResult;
use crate::models::DeliveryJob;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A leased job; pass it back to `ack` or `nack`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub receipt: Uuid,
    pub job: DeliveryJob,
    /// Backend-specific handle of the leased entry
    pub(crate) token: String,
}

/// Snapshot of queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Jobs waiting (due or delayed)
    pub scheduled: u64,
    /// Jobs currently leased to a worker
    pub in_flight: u64,
}

/// Entry as stored by the queue backends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct QueuedJob {
    pub receipt: Uuid,
    pub job: DeliveryJob,
}

impl QueuedJob {
    pub fn new(job: DeliveryJob) -> Self {
        Self {
            receipt: Uuid::new_v4(),
            job,
        }
    }
}

/// Durable, delayed, at-least-once queue contract
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Schedule `job` to become visible after `delay`
    async fn enqueue(&self, job: DeliveryJob, delay: Duration) -> WebhookDeliveryResult<()>;

    /// Lease the next due job, waiting up to `wait` for one to appear
    async fn dequeue(&self, wait: Duration) -> WebhookDeliveryResult<Option<Lease>>;

    /// Remove a leased job for good
    async fn ack(&self, lease: &Lease) -> WebhookDeliveryResult<()>;

    /// Return a leased job to the queue, visible again after `delay`
    async fn nack(&self, lease: &Lease, delay: Duration) -> WebhookDeliveryResult<()>;

    async fn depth(&self) -> WebhookDeliveryResult<QueueDepth>;
}
