//! Data models for the AI-CORE Webhook Delivery Service
//!
//! This module defines the lifecycle event contract consumed from the business layer,
//! the webhook endpoint configuration owned by the registry, and the delivery record
//! that tracks one (endpoint, event) pairing through its attempts.

use crate::webhook::conditions::ConditionTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Trigger table: lower-cased model name → action → enabled
pub type Triggers = HashMap<String, HashMap<String, bool>>;

/// Statuses the endpoint answers with that are worth another attempt by default
pub const DEFAULT_RETRY_ON_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Context attached to every lifecycle event by the emitting service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// Internal notification emitted around a CRUD-like operation on a domain entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    /// Upstream event id; derived from the context when the emitter omits it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub event: String,
    pub model: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    pub context: EventContext,
}

impl LifecycleEvent {
    /// Stable identifier of this logical event.
    ///
    /// A redelivered copy of the same event (same model, event name, request id and
    /// timestamp) yields the same id, which keeps the dispatcher's idempotency key stable.
    pub fn event_id(&self) -> String {
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }

        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(b"|");
        hasher.update(self.event.as_bytes());
        hasher.update(b"|");
        hasher.update(self.context.request_id.as_bytes());
        hasher.update(b"|");
        hasher.update(self.context.timestamp.to_rfc3339().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Lower-cased model name, the key used in trigger tables
    pub fn model_key(&self) -> String {
        self.model.to_lowercase()
    }

    /// Trigger verb for this event (`created` → `create`)
    pub fn action(&self) -> String {
        normalize_action(&self.event)
    }

    /// Event type as sent to endpoints, e.g. `user.created`
    pub fn event_type(&self) -> String {
        format!("{}.{}", self.model_key(), self.event.to_lowercase())
    }
}

/// Lifecycle verbs, in both trigger and past-tense form
const LIFECYCLE_VERBS: [(&str, &str); 4] = [
    ("create", "created"),
    ("update", "updated"),
    ("delete", "deleted"),
    ("restore", "restored"),
];

fn lifecycle_verb(name: &str) -> Option<&'static str> {
    LIFECYCLE_VERBS
        .iter()
        .find(|(verb, past)| name == *verb || name == *past)
        .map(|(verb, _)| *verb)
}

/// Map a lifecycle event name onto the verb used in trigger tables.
///
/// `after_`/`before_` prefixes are always stripped. The bare `after`/`before` hook
/// prefix (`afterUpdate`) is only stripped in front of a lifecycle verb, so names like
/// `aftermath` stay intact.
pub fn normalize_action(event: &str) -> String {
    let lowered = event.trim().to_lowercase();
    let stripped = lowered
        .strip_prefix("after_")
        .or_else(|| lowered.strip_prefix("before_"))
        .or_else(|| {
            lowered
                .strip_prefix("after")
                .or_else(|| lowered.strip_prefix("before"))
                .filter(|rest| lifecycle_verb(rest).is_some())
        })
        .filter(|rest| !rest.is_empty())
        .unwrap_or(&lowered);

    lifecycle_verb(stripped).unwrap_or(stripped).to_string()
}

/// HTTP method used for a webhook call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl WebhookMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }
}

impl From<WebhookMethod> for reqwest::Method {
    fn from(method: WebhookMethod) -> Self {
        match method {
            WebhookMethod::Post => reqwest::Method::POST,
            WebhookMethod::Put => reqwest::Method::PUT,
            WebhookMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

impl FromStr for WebhookMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            other => Err(format!("unsupported webhook method: {}", other)),
        }
    }
}

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
}

/// Per-endpoint retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    /// Base delay in milliseconds
    #[serde(rename = "initialDelay")]
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay in milliseconds
    #[serde(rename = "maxDelay")]
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: true,
            retry_on_status: DEFAULT_RETRY_ON_STATUS.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn retries_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }
}

/// A tenant-configured external HTTP destination
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub triggers: Triggers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<ConditionTree>,
    pub secret: String,
    pub active: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Whether the trigger table enables this (model, action) pair.
    ///
    /// The raw event name is accepted as well so `{"user": {"created": true}}` keeps working.
    pub fn is_triggered_by(&self, model: &str, action: &str, raw_event: &str) -> bool {
        self.triggers
            .get(&model.to_lowercase())
            .map(|actions| {
                actions.get(action).copied().unwrap_or(false)
                    || actions
                        .get(&raw_event.to_lowercase())
                        .copied()
                        .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

impl fmt::Debug for WebhookEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookEndpoint")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("method", &self.method)
            .field("triggers", &self.triggers)
            .field("conditions", &self.conditions)
            .field("secret", &"<redacted>")
            .field("active", &self.active)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Input for registering an endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWebhookEndpoint {
    pub tenant_id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: Option<WebhookMethod>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub triggers: Triggers,
    #[serde(default)]
    pub conditions: Option<ConditionTree>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Partial update of an endpoint; the secret is deliberately absent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEndpointPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<WebhookMethod>,
    pub headers: Option<HashMap<String, String>>,
    pub triggers: Option<Triggers>,
    /// `Some(None)` clears the conditions
    pub conditions: Option<Option<ConditionTree>>,
    pub active: Option<bool>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Delivery record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Retrying,
    Success,
    Failed,
    DeadLetter,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Terminal records never change again outside an explicit admin retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::DeadLetter)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}

/// Persisted unit of work for one (endpoint, event) pairing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub webhook_endpoint_id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub idempotency_key: String,
    /// Outbound body snapshot, fixed at creation
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl DeliveryRecord {
    /// Create a pending record for `endpoint` carrying `payload`
    pub fn pending(
        endpoint: &WebhookEndpoint,
        event_type: String,
        idempotency_key: String,
        id: Uuid,
        payload: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            webhook_endpoint_id: endpoint.id,
            tenant_id: endpoint.tenant_id.clone(),
            event_type,
            idempotency_key,
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: endpoint.retry_policy.max_attempts.max(1),
            created_at,
            first_attempt_at: None,
            last_attempt_at: None,
            next_attempt_at: Some(created_at),
            completed_at: None,
            response_status: None,
            response_body: None,
            response_time_ms: None,
            error_message: None,
        }
    }

    /// Current mutable state, the starting point for the next transition
    pub fn attempt_state(&self) -> DeliveryAttempt {
        DeliveryAttempt {
            status: self.status,
            attempt_count: self.attempt_count,
            first_attempt_at: self.first_attempt_at,
            last_attempt_at: self.last_attempt_at,
            next_attempt_at: self.next_attempt_at,
            completed_at: self.completed_at,
            response_status: self.response_status,
            response_body: self.response_body.clone(),
            response_time_ms: self.response_time_ms,
            error_message: self.error_message.clone(),
        }
    }

    pub fn apply(&mut self, attempt: DeliveryAttempt) {
        self.status = attempt.status;
        self.attempt_count = attempt.attempt_count;
        self.first_attempt_at = attempt.first_attempt_at;
        self.last_attempt_at = attempt.last_attempt_at;
        self.next_attempt_at = attempt.next_attempt_at;
        self.completed_at = attempt.completed_at;
        self.response_status = attempt.response_status;
        self.response_body = attempt.response_body;
        self.response_time_ms = attempt.response_time_ms;
        self.error_message = attempt.error_message;
    }

    /// Whether a record in `retrying` may be picked up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// The mutable part of a delivery record, written as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt {
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// Compare-and-swap precondition for a delivery write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusGuard {
    /// The write applies only while the stored status is one of these
    pub expected: Vec<DeliveryStatus>,
    /// When set, the stored attempt count must equal this
    pub attempt_count: Option<u32>,
    /// When set, `retrying` records must have `next_attempt_at <= due_by`
    pub due_by: Option<DateTime<Utc>>,
    /// When set, `processing` records must have been claimed at or before this instant
    pub claimed_before: Option<DateTime<Utc>>,
}

impl StatusGuard {
    pub fn expecting(expected: &[DeliveryStatus]) -> Self {
        Self {
            expected: expected.to_vec(),
            ..Default::default()
        }
    }

    /// Guard for claiming `observed` for an attempt at `now`.
    ///
    /// A `processing` record is only claimable once its claim is older than `stale_before`,
    /// which recovers records whose worker died mid-attempt.
    pub fn claim(
        observed: &DeliveryRecord,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Self {
        Self {
            expected: vec![observed.status],
            attempt_count: Some(observed.attempt_count),
            due_by: Some(now),
            claimed_before: Some(stale_before),
        }
    }

    /// Guard for finalizing an attempt this worker claimed
    pub fn claimed(attempt_count: u32) -> Self {
        Self {
            expected: vec![DeliveryStatus::Processing],
            attempt_count: Some(attempt_count),
            ..Default::default()
        }
    }

    pub fn admits(&self, record: &DeliveryRecord) -> bool {
        if !self.expected.contains(&record.status) {
            return false;
        }
        if self
            .attempt_count
            .map_or(false, |count| count != record.attempt_count)
        {
            return false;
        }
        match record.status {
            DeliveryStatus::Retrying => self.due_by.map_or(true, |now| record.is_due(now)),
            DeliveryStatus::Processing => self.claimed_before.map_or(true, |cutoff| {
                record.last_attempt_at.map_or(true, |claimed| claimed <= cutoff)
            }),
            _ => true,
        }
    }
}

/// Queue job; carries only the delivery id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub delivery_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(delivery_id: Uuid) -> Self {
        Self {
            delivery_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// Filter for listing delivery records
#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub tenant_id: Option<String>,
    pub endpoint_id: Option<Uuid>,
    pub status: Option<DeliveryStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DeliveryFilter {
    pub fn for_endpoint(endpoint_id: Uuid) -> Self {
        Self {
            endpoint_id: Some(endpoint_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &DeliveryRecord) -> bool {
        self.tenant_id
            .as_ref()
            .map_or(true, |tenant| &record.tenant_id == tenant)
            && self
                .endpoint_id
                .map_or(true, |id| record.webhook_endpoint_id == id)
            && self.status.map_or(true, |status| record.status == status)
            && self.since.map_or(true, |since| record.created_at >= since)
            && self.until.map_or(true, |until| record.created_at < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> LifecycleEvent {
        serde_json::from_value(json!({
            "event": "created",
            "model": "User",
            "data": {"id": 7, "email": "a@example.com"},
            "context": {
                "tenantId": "tenant-1",
                "userRole": "admin",
                "requestId": "req-1",
                "timestamp": "2024-05-01T10:00:00Z",
                "source": "api"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_action() {
        assert_eq!(normalize_action("created"), "create");
        assert_eq!(normalize_action("afterUpdate"), "update");
        assert_eq!(normalize_action("after_delete"), "delete");
        assert_eq!(normalize_action("Deleted"), "delete");
        assert_eq!(normalize_action("published"), "published");
        assert_eq!(normalize_action("beforeRestore"), "restore");
        assert_eq!(normalize_action("aftermath"), "aftermath");
        assert_eq!(normalize_action("beforehand"), "beforehand");
    }

    #[test]
    fn test_event_id_is_stable_without_explicit_id() {
        let event = sample_event();
        assert_eq!(event.event_id(), event.clone().event_id());

        let mut other = event.clone();
        other.context.request_id = "req-2".to_string();
        assert_ne!(event.event_id(), other.event_id());

        let mut explicit = event.clone();
        explicit.id = Some("evt-1".to_string());
        assert_eq!(explicit.event_id(), "evt-1");
    }

    #[test]
    fn test_event_type_and_action() {
        let event = sample_event();
        assert_eq!(event.event_type(), "user.created");
        assert_eq!(event.action(), "create");
        assert_eq!(event.model_key(), "user");
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential);
        assert!(policy.retries_status(503));
        assert!(!policy.retries_status(404));
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Processing,
            DeliveryStatus::Retrying,
            DeliveryStatus::Success,
            DeliveryStatus::Failed,
            DeliveryStatus::DeadLetter,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>(), Ok(status));
        }
        assert!(DeliveryStatus::DeadLetter.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_claim_guard_respects_due_time_and_count() {
        let now = Utc::now();
        let mut record = DeliveryRecord {
            id: Uuid::new_v4(),
            webhook_endpoint_id: Uuid::new_v4(),
            tenant_id: "t".to_string(),
            event_type: "user.created".to_string(),
            idempotency_key: "k".to_string(),
            payload: json!({}),
            status: DeliveryStatus::Retrying,
            attempt_count: 1,
            max_attempts: 3,
            created_at: now,
            first_attempt_at: Some(now),
            last_attempt_at: Some(now),
            next_attempt_at: Some(now + chrono::Duration::seconds(30)),
            completed_at: None,
            response_status: Some(500),
            response_body: None,
            response_time_ms: None,
            error_message: None,
        };

        let stale = now - chrono::Duration::seconds(60);
        assert!(!StatusGuard::claim(&record, now, stale).admits(&record));

        record.next_attempt_at = Some(now - chrono::Duration::seconds(1));
        let guard = StatusGuard::claim(&record, now, stale);
        assert!(guard.admits(&record));

        // another worker already moved the record on
        let mut advanced = record.clone();
        advanced.attempt_count = 2;
        assert!(!guard.admits(&advanced));
        advanced.status = DeliveryStatus::Processing;
        assert!(!guard.admits(&advanced));
    }

    #[test]
    fn test_stale_processing_claim_can_be_reclaimed() {
        let now = Utc::now();
        let mut record = DeliveryRecord {
            id: Uuid::new_v4(),
            webhook_endpoint_id: Uuid::new_v4(),
            tenant_id: "t".to_string(),
            event_type: "user.created".to_string(),
            idempotency_key: "k".to_string(),
            payload: json!({}),
            status: DeliveryStatus::Processing,
            attempt_count: 1,
            max_attempts: 3,
            created_at: now,
            first_attempt_at: Some(now),
            last_attempt_at: Some(now),
            next_attempt_at: None,
            completed_at: None,
            response_status: None,
            response_body: None,
            response_time_ms: None,
            error_message: None,
        };

        let stale_before = now - chrono::Duration::seconds(60);
        assert!(!StatusGuard::claim(&record, now, stale_before).admits(&record));

        record.last_attempt_at = Some(now - chrono::Duration::seconds(120));
        assert!(StatusGuard::claim(&record, now, stale_before).admits(&record));
        assert!(StatusGuard::claimed(1).admits(&record));
        assert!(!StatusGuard::claimed(2).admits(&record));
    }
}
