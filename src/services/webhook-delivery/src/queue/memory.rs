//! In-process delivery queue

use super::{DeliveryQueue, Lease, QueueDepth, QueuedJob};
use crate::error::WebhookDeliveryResult;
use crate::models::DeliveryJob;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Default)]
struct QueueState {
    /// Ordered by (visible_at, sequence)
    scheduled: BTreeMap<(Instant, u64), QueuedJob>,
    /// receipt → (lease deadline, job)
    in_flight: HashMap<Uuid, (Instant, QueuedJob)>,
    sequence: u64,
}

impl QueueState {
    fn schedule(&mut self, at: Instant, job: QueuedJob) {
        self.sequence += 1;
        self.scheduled.insert((at, self.sequence), job);
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();

        for receipt in expired {
            if let Some((_, job)) = self.in_flight.remove(&receipt) {
                self.schedule(now, job);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let next_due = self.scheduled.keys().next().map(|(at, _)| *at);
        let next_expiry = self.in_flight.values().map(|(deadline, _)| *deadline).min();
        match (next_due, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Queue held in process memory; suitable for tests and single-node deployments
#[derive(Debug, Clone)]
pub struct MemoryDeliveryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
}

impl MemoryDeliveryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    fn try_lease(&self) -> Result<Lease, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);

        let due_key = state
            .scheduled
            .keys()
            .next()
            .copied()
            .filter(|(at, _)| *at <= now);

        match due_key.and_then(|key| state.scheduled.remove(&key)) {
            Some(queued) => {
                let lease = Lease {
                    receipt: queued.receipt,
                    job: queued.job,
                    token: queued.receipt.to_string(),
                };
                state
                    .in_flight
                    .insert(queued.receipt, (now + self.visibility_timeout, queued));
                Ok(lease)
            }
            None => Err(state.next_wakeup()),
        }
    }
}

impl Default for MemoryDeliveryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl DeliveryQueue for MemoryDeliveryQueue {
    async fn enqueue(&self, job: DeliveryJob, delay: Duration) -> WebhookDeliveryResult<()> {
        self.state
            .lock()
            .schedule(Instant::now() + delay, QueuedJob::new(job));
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> WebhookDeliveryResult<Option<Lease>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.try_lease() {
                Ok(lease) => return Ok(Some(lease)),
                Err(next) => next.map_or(deadline, |next| next.min(deadline)),
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> WebhookDeliveryResult<()> {
        let mut state = self.state.lock();
        if state.in_flight.remove(&lease.receipt).is_none() {
            // The lease expired and the job was rescheduled; drop that copy too
            state
                .scheduled
                .retain(|_, queued| queued.receipt != lease.receipt);
        }
        Ok(())
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> WebhookDeliveryResult<()> {
        {
            let mut state = self.state.lock();
            state.in_flight.remove(&lease.receipt);
            state
                .scheduled
                .retain(|_, queued| queued.receipt != lease.receipt);
            state.schedule(
                Instant::now() + delay,
                QueuedJob {
                    receipt: lease.receipt,
                    job: lease.job,
                },
            );
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self) -> WebhookDeliveryResult<QueueDepth> {
        let state = self.state.lock();
        Ok(QueueDepth {
            scheduled: state.scheduled.len() as u64,
            in_flight: state.in_flight.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let queue = MemoryDeliveryQueue::default();
        let job = DeliveryJob::new(Uuid::new_v4());
        queue.enqueue(job, Duration::ZERO).await.unwrap();

        let lease = queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.job.delivery_id, job.delivery_id);
        assert_eq!(queue.depth().await.unwrap().in_flight, 1);

        queue.ack(&lease).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
        assert!(queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_becomes_visible() {
        let queue = MemoryDeliveryQueue::default();
        let job = DeliveryJob::new(Uuid::new_v4());
        queue.enqueue(job, Duration::from_secs(5)).await.unwrap();

        assert!(queue.dequeue(Duration::from_secs(1)).await.unwrap().is_none());

        let lease = queue.dequeue(Duration::from_secs(10)).await.unwrap();
        assert_eq!(lease.map(|lease| lease.job.delivery_id), Some(job.delivery_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_lease_is_redelivered() {
        let queue = MemoryDeliveryQueue::new(Duration::from_secs(30));
        let job = DeliveryJob::new(Uuid::new_v4());
        queue.enqueue(job, Duration::ZERO).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.dequeue(Duration::from_secs(1)).await.unwrap().is_none());

        let second = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.receipt, second.receipt);
    }

    #[tokio::test]
    async fn test_nack_reschedules() {
        let queue = MemoryDeliveryQueue::default();
        queue
            .enqueue(DeliveryJob::new(Uuid::new_v4()), Duration::ZERO)
            .await
            .unwrap();

        let lease = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.nack(&lease, Duration::ZERO).await.unwrap();

        let again = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.job, lease.job);
    }

    #[tokio::test]
    async fn test_waiting_dequeue_wakes_on_enqueue() {
        let queue = MemoryDeliveryQueue::default();
        let consumer = queue.clone();
        let handle = tokio::spawn(async move { consumer.dequeue(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = DeliveryJob::new(Uuid::new_v4());
        queue.enqueue(job, Duration::ZERO).await.unwrap();

        let lease = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(lease.job, job);
    }
}
