//! # Delivery Worker
//!
//! Executes one delivery attempt per dequeued job:
//!
//! 1. claim the record (`pending`/due `retrying` → `processing`) with a guarded write,
//!    aborting silently when another worker won the claim
//! 2. re-read the endpoint and give up with `failed` if it is gone or inactive
//! 3. sign and send the payload snapshot
//! 4. record the outcome and either finish, dead-letter, or schedule the next attempt
//!    as a delayed queue job
//!
//! A record left in `processing` by a worker that died mid-attempt becomes claimable
//! again once its claim is older than `stale_claim_after`.

use super::processor::{JobDisposition, JobHandler};
use super::registry::WebhookRegistry;
use super::retry::{self, AttemptOutcome, RetryDecision};
use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::metrics::WebhookMetrics;
use crate::models::{DeliveryJob, DeliveryRecord, DeliveryStatus, StatusGuard, WebhookEndpoint};
use crate::queue::DeliveryQueue;
use crate::security::{headers, SecurityUtils};
use crate::storage::DeliveryStore;
use crate::utils::{StringUtils, MAX_RESPONSE_BODY_CHARS};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect, Client};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// `errorMessage` of a delivery whose endpoint was deleted before the attempt
pub const ENDPOINT_NOT_FOUND: &str = "endpoint_not_found";

/// `errorMessage` of a delivery whose endpoint was deactivated before the attempt
pub const ENDPOINT_INACTIVE: &str = "endpoint_inactive";

/// Outbound HTTP and claim settings
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Upper bound of one outbound HTTP call
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Age after which a `processing` claim is considered abandoned
    pub stale_claim_after: Duration,
    /// Redelivery delay after a store or queue failure
    pub requeue_delay: Duration,
    pub verify_tls: bool,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("AI-CORE-Webhooks/{}", env!("CARGO_PKG_VERSION")),
            stale_claim_after: Duration::from_secs(90),
            requeue_delay: Duration::from_secs(5),
            verify_tls: true,
        }
    }
}

/// Raised when a delivery exhausts its attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterAlert {
    pub delivery_id: Uuid,
    pub endpoint_id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub attempts: u32,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterAlert {
    pub fn from_record(record: &DeliveryRecord) -> Self {
        Self {
            delivery_id: record.id,
            endpoint_id: record.webhook_endpoint_id,
            tenant_id: record.tenant_id.clone(),
            event_type: record.event_type.clone(),
            attempts: record.attempt_count,
            last_status: record.response_status,
            last_error: record.error_message.clone(),
            dead_lettered_at: record.completed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Receives dead-letter alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn dead_letter(&self, alert: &DeadLetterAlert);
}

/// Alert sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAlertSink;

#[async_trait]
impl AlertSink for LoggingAlertSink {
    async fn dead_letter(&self, alert: &DeadLetterAlert) {
        let exhausted = WebhookDeliveryError::exhausted(alert.delivery_id, alert.attempts);
        error!(
            delivery_id = %alert.delivery_id,
            endpoint_id = %alert.endpoint_id,
            tenant_id = %alert.tenant_id,
            event_type = %alert.event_type,
            error_code = exhausted.error_code(),
            last_status = ?alert.last_status,
            last_error = ?alert.last_error,
            "{}",
            exhausted
        );
    }
}

/// Result of one outbound HTTP call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAttempt {
    /// `None` when no response arrived
    pub status: Option<u16>,
    pub body: Option<String>,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub timed_out: bool,
}

impl HttpAttempt {
    pub fn outcome(&self, endpoint: &WebhookEndpoint) -> AttemptOutcome {
        match self.status {
            Some(status) => retry::classify_status(status, &endpoint.retry_policy),
            None => AttemptOutcome::Retryable,
        }
    }

    pub fn response_time_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// Outcome of preparing a claimed delivery for sending
enum Prepared {
    Send {
        endpoint: WebhookEndpoint,
        body: Vec<u8>,
    },
    Abandon(&'static str),
}

/// Per-job delivery state machine
pub struct DeliveryWorker {
    store: Arc<dyn DeliveryStore>,
    registry: Arc<WebhookRegistry>,
    queue: Arc<dyn DeliveryQueue>,
    alerts: Arc<dyn AlertSink>,
    metrics: WebhookMetrics,
    client: Client,
    settings: DeliverySettings,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        registry: Arc<WebhookRegistry>,
        queue: Arc<dyn DeliveryQueue>,
        alerts: Arc<dyn AlertSink>,
        metrics: WebhookMetrics,
        settings: DeliverySettings,
    ) -> WebhookDeliveryResult<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;

        Ok(Self {
            store,
            registry,
            queue,
            alerts,
            metrics,
            client,
            settings,
        })
    }

    /// Run the delivery state machine for one record
    #[instrument(skip(self), fields(delivery_id = %delivery_id))]
    pub async fn process(&self, delivery_id: Uuid) -> WebhookDeliveryResult<JobDisposition> {
        let record = match self.store.get(delivery_id).await? {
            Some(record) => record,
            None => {
                warn!("Delivery record not found, dropping job");
                return Ok(JobDisposition::Ack);
            }
        };

        let now = Utc::now();
        if record.status.is_terminal() {
            debug!(status = %record.status, "Delivery already finished");
            return Ok(JobDisposition::Ack);
        }
        if let Some(delay) = self.not_ready_for(&record, now) {
            debug!(
                status = %record.status,
                delay_ms = delay.as_millis() as u64,
                "Delivery not claimable yet"
            );
            return Ok(JobDisposition::Requeue { delay });
        }

        let claimed = match self.claim(&record, now).await? {
            Some(claimed) => claimed,
            None => {
                debug!("Delivery claimed by another worker");
                return Ok(JobDisposition::Ack);
            }
        };

        let (endpoint, body) = match self.prepare(&claimed).await {
            Ok(Prepared::Send { endpoint, body }) => (endpoint, body),
            Ok(Prepared::Abandon(reason)) => return self.abandon(&record, &claimed, reason).await,
            Err(e) => {
                self.release(&record, &claimed).await;
                return Err(e);
            }
        };

        let http = self
            .send_signed(&endpoint, claimed.id, &claimed.event_type, body)
            .await;
        self.finalize(&endpoint, &claimed, http).await
    }

    /// Sign `body` with the endpoint secret and send it once
    pub async fn send_signed(
        &self,
        endpoint: &WebhookEndpoint,
        delivery_id: Uuid,
        event_type: &str,
        body: Vec<u8>,
    ) -> HttpAttempt {
        let started = Instant::now();
        let signature = match SecurityUtils::sign_payload(&body, &endpoint.secret) {
            Ok(signature) => signature,
            Err(e) => {
                return HttpAttempt {
                    status: None,
                    body: None,
                    elapsed: started.elapsed(),
                    error: Some(e.to_string()),
                    timed_out: false,
                }
            }
        };

        let mut request = self
            .client
            .request(endpoint.method.into(), endpoint.url.as_str())
            .timeout(self.settings.request_timeout);
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let request = request
            .header(CONTENT_TYPE, "application/json")
            .header(headers::SIGNATURE, signature)
            .header(headers::EVENT, event_type)
            .header(headers::DELIVERY, delivery_id.to_string())
            .header(
                headers::TIMESTAMP,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .body(body);

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let raw = read_capped(response, MAX_RESPONSE_BODY_CHARS * 4).await;
                let text = String::from_utf8_lossy(&raw);
                let error = if (200..300).contains(&status) {
                    None
                } else {
                    let retryable = endpoint.retry_policy.retries_status(status);
                    Some(WebhookDeliveryError::rejected(status, retryable).to_string())
                };
                HttpAttempt {
                    status: Some(status),
                    body: Some(StringUtils::truncate_chars(&text, MAX_RESPONSE_BODY_CHARS)),
                    elapsed: started.elapsed(),
                    error,
                    timed_out: false,
                }
            }
            Err(e) => {
                let transport = WebhookDeliveryError::transport(e.to_string(), e.is_timeout());
                HttpAttempt {
                    status: None,
                    body: None,
                    elapsed: started.elapsed(),
                    error: Some(transport.to_string()),
                    timed_out: e.is_timeout(),
                }
            }
        }
    }

    /// Delay until `record` may be claimed, or `None` if it can be claimed now
    fn not_ready_for(&self, record: &DeliveryRecord, now: DateTime<Utc>) -> Option<Duration> {
        match record.status {
            DeliveryStatus::Retrying if !record.is_due(now) => {
                record.next_attempt_at.map(|at| until(at, now))
            }
            DeliveryStatus::Processing => {
                let stale_at = record.last_attempt_at? + to_chrono(self.settings.stale_claim_after);
                (stale_at > now).then(|| until(stale_at, now))
            }
            _ => None,
        }
    }

    async fn claim(
        &self,
        record: &DeliveryRecord,
        now: DateTime<Utc>,
    ) -> WebhookDeliveryResult<Option<DeliveryRecord>> {
        let stale_before = now - to_chrono(self.settings.stale_claim_after);
        let guard = StatusGuard::claim(record, now, stale_before);

        let mut claim = record.attempt_state();
        claim.status = DeliveryStatus::Processing;
        claim.last_attempt_at = Some(now);
        claim.first_attempt_at.get_or_insert(now);
        // A reclaimed stale attempt was already counted
        if record.status != DeliveryStatus::Processing {
            claim.attempt_count += 1;
        }

        if claim.attempt_count > record.max_attempts {
            warn!(
                attempts = record.attempt_count,
                max_attempts = record.max_attempts,
                "Delivery has no attempts left"
            );
            let mut exhausted = record.attempt_state();
            exhausted.status = DeliveryStatus::DeadLetter;
            exhausted.completed_at = Some(now);
            exhausted.next_attempt_at = None;
            if let Some(updated) = self
                .store
                .update_delivery_attempt(record.id, &guard, exhausted)
                .await?
            {
                self.dead_letter(&updated).await;
            }
            return Ok(None);
        }

        self.store
            .update_delivery_attempt(record.id, &guard, claim)
            .await
    }

    async fn prepare(&self, claimed: &DeliveryRecord) -> WebhookDeliveryResult<Prepared> {
        let endpoint = match self.registry.get(claimed.webhook_endpoint_id).await? {
            Some(endpoint) if endpoint.active => endpoint,
            Some(_) => return Ok(Prepared::Abandon(ENDPOINT_INACTIVE)),
            None => return Ok(Prepared::Abandon(ENDPOINT_NOT_FOUND)),
        };
        let body = serde_json::to_vec(&claimed.payload)?;
        Ok(Prepared::Send { endpoint, body })
    }

    /// Finish a claimed delivery as `failed` without an attempt
    async fn abandon(
        &self,
        observed: &DeliveryRecord,
        claimed: &DeliveryRecord,
        reason: &'static str,
    ) -> WebhookDeliveryResult<JobDisposition> {
        let mut failed = observed.attempt_state();
        failed.status = DeliveryStatus::Failed;
        failed.completed_at = Some(Utc::now());
        failed.next_attempt_at = None;
        failed.error_message = Some(reason.to_string());

        let guard = StatusGuard::claimed(claimed.attempt_count);
        if self
            .store
            .update_delivery_attempt(claimed.id, &guard, failed)
            .await?
            .is_some()
        {
            warn!(
                endpoint_id = %claimed.webhook_endpoint_id,
                reason,
                "Delivery abandoned"
            );
            self.metrics.record_attempt("abandoned", None);
        }
        Ok(JobDisposition::Ack)
    }

    /// Undo a claim when no attempt was made
    async fn release(&self, observed: &DeliveryRecord, claimed: &DeliveryRecord) {
        let guard = StatusGuard::claimed(claimed.attempt_count);
        if let Err(e) = self
            .store
            .update_delivery_attempt(claimed.id, &guard, observed.attempt_state())
            .await
        {
            // Left in processing; it is reclaimed once stale
            warn!(delivery_id = %claimed.id, error = %e, "Failed to release delivery claim");
        }
    }

    async fn finalize(
        &self,
        endpoint: &WebhookEndpoint,
        claimed: &DeliveryRecord,
        http: HttpAttempt,
    ) -> WebhookDeliveryResult<JobDisposition> {
        let now = Utc::now();
        let outcome = http.outcome(endpoint);
        self.metrics.record_attempt(outcome.as_str(), Some(http.elapsed));

        let mut next = claimed.attempt_state();
        next.response_status = http.status;
        next.response_time_ms = Some(http.response_time_ms());
        next.response_body = http.body;
        next.error_message = http.error;
        next.next_attempt_at = None;

        let mut retry_in = None;
        match outcome {
            AttemptOutcome::Delivered => {
                next.status = DeliveryStatus::Success;
                next.completed_at = Some(now);
            }
            AttemptOutcome::Rejected => {
                next.status = DeliveryStatus::Failed;
                next.completed_at = Some(now);
            }
            AttemptOutcome::Retryable => match retry::decide(
                &endpoint.retry_policy,
                claimed.attempt_count,
                claimed.max_attempts,
            ) {
                RetryDecision::DeadLetter => {
                    next.status = DeliveryStatus::DeadLetter;
                    next.completed_at = Some(now);
                }
                RetryDecision::Retry { delay } => {
                    next.status = DeliveryStatus::Retrying;
                    next.next_attempt_at = Some(now + to_chrono(delay));
                    retry_in = Some(delay);
                }
            },
        }

        let guard = StatusGuard::claimed(claimed.attempt_count);
        let updated = match self
            .store
            .update_delivery_attempt(claimed.id, &guard, next)
            .await?
        {
            Some(updated) => updated,
            None => {
                warn!("Delivery claim was lost before the attempt could be recorded");
                return Ok(JobDisposition::Ack);
            }
        };

        match updated.status {
            DeliveryStatus::Success => info!(
                endpoint_id = %endpoint.id,
                attempt = updated.attempt_count,
                status_code = ?updated.response_status,
                response_time_ms = ?updated.response_time_ms,
                "Webhook delivered"
            ),
            DeliveryStatus::Failed => warn!(
                endpoint_id = %endpoint.id,
                attempt = updated.attempt_count,
                status_code = ?updated.response_status,
                "Webhook rejected, not retrying"
            ),
            DeliveryStatus::DeadLetter => self.dead_letter(&updated).await,
            _ => info!(
                endpoint_id = %endpoint.id,
                attempt = updated.attempt_count,
                next_attempt_at = ?updated.next_attempt_at,
                error = ?updated.error_message,
                "Webhook attempt failed, retry scheduled"
            ),
        }

        if let Some(delay) = retry_in {
            if let Err(e) = self.queue.enqueue(DeliveryJob::new(updated.id), delay).await {
                warn!(error = %e, "Failed to schedule retry job, reusing the current lease");
                return Ok(JobDisposition::Requeue { delay });
            }
        }
        Ok(JobDisposition::Ack)
    }

    async fn dead_letter(&self, record: &DeliveryRecord) {
        self.metrics.record_dead_letter();
        self.alerts.dead_letter(&DeadLetterAlert::from_record(record)).await;
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn handle(&self, job: &DeliveryJob) -> JobDisposition {
        match self.process(job.delivery_id).await {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!(
                    delivery_id = %job.delivery_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Delivery job failed, requeueing"
                );
                JobDisposition::Requeue {
                    delay: self.settings.requeue_delay,
                }
            }
        }
    }
}

/// Read at most `limit` bytes of the response body; the rest is never buffered
async fn read_capped(mut response: reqwest::Response, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Response body read failed");
                break;
            }
        }
    }
    buf
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}
