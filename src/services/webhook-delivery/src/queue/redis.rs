//! Redis-backed delivery queue
//!
//! Two sorted sets per queue: `{prefix}scheduled` scored by the time a job becomes
//! visible, and `{prefix}inflight` scored by lease expiry. Leasing runs as one Lua
//! script so that concurrent workers never receive the same entry.

use super::{DeliveryQueue, Lease, QueueDepth, QueuedJob};
use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::models::DeliveryJob;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::Pool;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Moves expired leases back to `scheduled`, then leases one due entry
const LEASE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 100)
for _, member in ipairs(expired) do
    redis.call('ZREM', KEYS[2], member)
    redis.call('ZADD', KEYS[1], now, member)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, 1)
if #due == 0 then
    return false
end
redis.call('ZREM', KEYS[1], due[1])
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), due[1])
return due[1]
"#;

/// Queue stored in Redis sorted sets
#[derive(Clone)]
pub struct RedisDeliveryQueue {
    pool: Pool,
    scheduled_key: String,
    in_flight_key: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl RedisDeliveryQueue {
    pub fn new(
        pool: Pool,
        key_prefix: &str,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            scheduled_key: format!("{}scheduled", key_prefix),
            in_flight_key: format!("{}inflight", key_prefix),
            visibility_timeout,
            poll_interval,
        }
    }

    fn score_after(delay: Duration) -> i64 {
        Utc::now().timestamp_millis() + delay.as_millis() as i64
    }

    async fn try_lease(&self) -> WebhookDeliveryResult<Option<Lease>> {
        let mut conn = self.pool.get().await?;
        let member: Option<String> = redis::Script::new(LEASE_SCRIPT)
            .key(&self.scheduled_key)
            .key(&self.in_flight_key)
            .arg(Utc::now().timestamp_millis())
            .arg(self.visibility_timeout.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        match member {
            Some(member) => {
                let queued: QueuedJob = serde_json::from_str(&member)?;
                Ok(Some(Lease {
                    receipt: queued.receipt,
                    job: queued.job,
                    token: member,
                }))
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for RedisDeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDeliveryQueue")
            .field("scheduled_key", &self.scheduled_key)
            .field("in_flight_key", &self.in_flight_key)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish()
    }
}

#[async_trait]
impl DeliveryQueue for RedisDeliveryQueue {
    #[instrument(skip(self, job), fields(delivery_id = %job.delivery_id))]
    async fn enqueue(&self, job: DeliveryJob, delay: Duration) -> WebhookDeliveryResult<()> {
        let member = serde_json::to_string(&QueuedJob::new(job))?;
        let mut conn = self.pool.get().await?;

        let _: () = redis::cmd("ZADD")
            .arg(&self.scheduled_key)
            .arg(Self::score_after(delay))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> WebhookDeliveryResult<Option<Lease>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_lease().await? {
                debug!(delivery_id = %lease.job.delivery_id, "Leased delivery job");
                return Ok(Some(lease));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, lease: &Lease) -> WebhookDeliveryResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&self.in_flight_key)
            .arg(&lease.token)
            .ignore()
            .cmd("ZREM")
            .arg(&self.scheduled_key)
            .arg(&lease.token)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, lease: &Lease, delay: Duration) -> WebhookDeliveryResult<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(&self.in_flight_key)
            .arg(&lease.token)
            .ignore()
            .cmd("ZADD")
            .arg(&self.scheduled_key)
            .arg(Self::score_after(delay))
            .arg(&lease.token)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn depth(&self) -> WebhookDeliveryResult<QueueDepth> {
        let mut conn = self.pool.get().await?;
        let (scheduled, in_flight): (u64, u64) = redis::pipe()
            .cmd("ZCARD")
            .arg(&self.scheduled_key)
            .cmd("ZCARD")
            .arg(&self.in_flight_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| WebhookDeliveryError::queue(format!("failed to read depth: {}", e)))?;

        Ok(QueueDepth {
            scheduled,
            in_flight,
        })
    }
}
