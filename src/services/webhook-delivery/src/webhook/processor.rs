//! # Worker Pool
//!
//! Pulls leased jobs from the [`DeliveryQueue`] and hands them to a [`JobHandler`]
//! with bounded global concurrency. The handler's disposition decides whether the
//! lease is acked or returned to the queue with a delay. Cancellation stops new
//! dequeues; in-flight jobs are given a grace period to finish.

use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::metrics::WebhookMetrics;
use crate::models::DeliveryJob;
use crate::queue::{DeliveryQueue, Lease};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What the pool should do with a lease once its job was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// Remove the job from the queue
    Ack,
    /// Make the job visible again after `delay`
    Requeue { delay: Duration },
}

/// Handles one dequeued job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &DeliveryJob) -> JobDisposition;
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum jobs handled at once
    pub concurrency: usize,
    /// How long one dequeue call waits for a job
    pub poll_wait: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_wait: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub running: bool,
    pub processed: u64,
    pub in_flight: usize,
    pub concurrency: usize,
}

/// Bounded-concurrency consumer of the delivery queue
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn DeliveryQueue>,
    handler: Arc<dyn JobHandler>,
    settings: PoolSettings,
    metrics: WebhookMetrics,
    limiter: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        handler: Arc<dyn JobHandler>,
        settings: PoolSettings,
        metrics: WebhookMetrics,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            queue,
            handler,
            settings: PoolSettings {
                concurrency,
                ..settings
            },
            metrics,
            limiter: Arc::new(Semaphore::new(concurrency)),
            running: Arc::new(AtomicBool::new(false)),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Consume the queue until `shutdown` is cancelled, then drain in-flight jobs
    pub async fn run(&self, shutdown: CancellationToken) -> WebhookDeliveryResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WebhookDeliveryError::invalid_state("worker pool is already running"));
        }
        info!(concurrency = self.settings.concurrency, "Starting delivery worker pool");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => permit
                    .map_err(|_| WebhookDeliveryError::internal("worker pool limiter closed"))?,
            };

            let lease = tokio::select! {
                _ = shutdown.cancelled() => break,
                lease = self.queue.dequeue(self.settings.poll_wait) => lease,
            };

            match lease {
                Ok(Some(lease)) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        pool.execute(lease).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.refresh_queue_depth().await;
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to dequeue delivery job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.poll_wait) => {}
                    }
                }
            }
        }

        self.drain().await;
        self.running.store(false, Ordering::SeqCst);
        info!(
            processed = self.processed.load(Ordering::Relaxed),
            "Delivery worker pool stopped"
        );
        Ok(())
    }

    /// Dequeue and handle a single job inline; returns `None` if none arrived within `wait`
    pub async fn process_next(&self, wait: Duration) -> WebhookDeliveryResult<Option<JobDisposition>> {
        match self.queue.dequeue(wait).await? {
            Some(lease) => Ok(Some(self.execute(lease).await)),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            running: self.running.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::Relaxed),
            in_flight: self.settings.concurrency - self.limiter.available_permits(),
            concurrency: self.settings.concurrency,
        }
    }

    async fn execute(&self, lease: Lease) -> JobDisposition {
        self.metrics.worker_started();
        let disposition = self.handler.handle(&lease.job).await;

        let result = match disposition {
            JobDisposition::Ack => self.queue.ack(&lease).await,
            JobDisposition::Requeue { delay } => {
                debug!(
                    delivery_id = %lease.job.delivery_id,
                    delay_ms = delay.as_millis() as u64,
                    "Requeueing delivery job"
                );
                self.queue.nack(&lease, delay).await
            }
        };
        if let Err(e) = result {
            // The lease expires and the job is redelivered
            warn!(delivery_id = %lease.job.delivery_id, error = %e, "Failed to settle lease");
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.metrics.worker_finished();
        disposition
    }

    async fn drain(&self) {
        let permits = self.settings.concurrency as u32;
        match tokio::time::timeout(
            self.settings.shutdown_grace,
            self.limiter.acquire_many(permits),
        )
        .await
        {
            Ok(Ok(_all)) => debug!("All in-flight deliveries finished"),
            Ok(Err(_)) => warn!("Worker pool limiter closed during drain"),
            Err(_) => warn!(
                in_flight = self.settings.concurrency - self.limiter.available_permits(),
                "Shutdown grace period elapsed with deliveries still in flight"
            ),
        }
    }

    async fn refresh_queue_depth(&self) {
        match self.queue.depth().await {
            Ok(depth) => self.metrics.set_queue_depth(depth),
            Err(e) => debug!(error = %e, "Could not read queue depth"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryDeliveryQueue;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingHandler {
        seen: Mutex<Vec<Uuid>>,
        requeue_first: Mutex<HashSet<Uuid>>,
        concurrent: AtomicU64,
        peak: AtomicU64,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, job: &DeliveryJob) -> JobDisposition {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            self.seen.lock().push(job.delivery_id);
            if self.requeue_first.lock().insert(job.delivery_id) {
                JobDisposition::Requeue {
                    delay: Duration::ZERO,
                }
            } else {
                JobDisposition::Ack
            }
        }
    }

    fn pool(
        queue: &MemoryDeliveryQueue,
        handler: Arc<CountingHandler>,
        concurrency: usize,
    ) -> WorkerPool {
        WorkerPool::new(
            Arc::new(queue.clone()),
            handler,
            PoolSettings {
                concurrency,
                poll_wait: Duration::from_millis(10),
                shutdown_grace: Duration::from_secs(5),
            },
            WebhookMetrics::new("pool_test").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_process_next_requeues_then_acks() {
        let queue = MemoryDeliveryQueue::default();
        let handler = Arc::new(CountingHandler::default());
        let pool = pool(&queue, handler.clone(), 1);
        queue
            .enqueue(DeliveryJob::new(Uuid::new_v4()), Duration::ZERO)
            .await
            .unwrap();

        let first = pool.process_next(Duration::ZERO).await.unwrap();
        assert!(matches!(first, Some(JobDisposition::Requeue { .. })));

        let second = pool.process_next(Duration::ZERO).await.unwrap();
        assert_eq!(second, Some(JobDisposition::Ack));

        assert_eq!(pool.process_next(Duration::ZERO).await.unwrap(), None);
        assert_eq!(handler.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_run_respects_concurrency_and_drains_on_shutdown() {
        let queue = MemoryDeliveryQueue::default();
        let handler = Arc::new(CountingHandler::default());
        let pool = pool(&queue, handler.clone(), 3);

        for _ in 0..12 {
            queue
                .enqueue(DeliveryJob::new(Uuid::new_v4()), Duration::ZERO)
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let runner = {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        // every job is handled twice: requeued once, then acked
        for _ in 0..200 {
            if handler.seen.lock().len() >= 24 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        runner.await.unwrap().unwrap();

        assert_eq!(handler.seen.lock().len(), 24);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        assert!(!pool.stats().running);
        assert_eq!(queue.depth().await.unwrap(), Default::default());
    }
}
