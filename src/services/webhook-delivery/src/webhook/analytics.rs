//! # Delivery Analytics
//!
//! Aggregates computed straight from the delivery store for a time window. Nothing
//! here is cached; every call reflects the records as they are now.

use crate::error::WebhookDeliveryResult;
use crate::models::{DeliveryFilter, DeliveryRecord, DeliveryStatus};
use crate::storage::DeliveryStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Number of error codes reported in [`DeliveryStats::top_errors`]
pub const TOP_ERRORS: usize = 5;

/// Aggregated delivery statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub total: u64,
    pub succeeded: u64,
    /// `failed` plus `dead_letter`
    pub failed: u64,
    /// `pending`, `processing` and `retrying`
    pub in_progress: u64,
    /// Succeeded over finished records, 0 when none finished
    pub success_rate: f64,
    pub status_breakdown: BTreeMap<String, u64>,
    pub avg_response_time_ms: Option<f64>,
    pub median_response_time_ms: Option<u64>,
    pub p95_response_time_ms: Option<u64>,
    pub top_errors: Vec<ErrorCount>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub code: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one endpoint over a window
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointHealth {
    pub endpoint_id: Uuid,
    pub verdict: HealthVerdict,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub stats: DeliveryStats,
}

/// Limits that turn an endpoint's numbers into a verdict
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub degraded_consecutive_failures: u32,
    pub unhealthy_consecutive_failures: u32,
    pub degraded_success_rate: f64,
    pub unhealthy_success_rate: f64,
    /// Finished records required before the success rate counts
    pub min_sample: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_consecutive_failures: 3,
            unhealthy_consecutive_failures: 10,
            degraded_success_rate: 0.95,
            unhealthy_success_rate: 0.5,
            min_sample: 10,
        }
    }
}

impl HealthThresholds {
    fn verdict(&self, stats: &DeliveryStats, consecutive_failures: u32) -> HealthVerdict {
        let finished = stats.succeeded + stats.failed;
        let rated = finished >= self.min_sample;

        if consecutive_failures >= self.unhealthy_consecutive_failures
            || (rated && stats.success_rate < self.unhealthy_success_rate)
        {
            HealthVerdict::Unhealthy
        } else if consecutive_failures >= self.degraded_consecutive_failures
            || (rated && stats.success_rate < self.degraded_success_rate)
        {
            HealthVerdict::Degraded
        } else {
            HealthVerdict::Healthy
        }
    }
}

pub struct DeliveryAnalytics {
    store: Arc<dyn DeliveryStore>,
    thresholds: HealthThresholds,
}

impl DeliveryAnalytics {
    pub fn new(store: Arc<dyn DeliveryStore>, thresholds: HealthThresholds) -> Self {
        Self { store, thresholds }
    }

    /// Statistics over every record matching `filter` (its `limit` is ignored)
    #[instrument(skip(self, filter))]
    pub async fn get_delivery_stats(
        &self,
        filter: &DeliveryFilter,
    ) -> WebhookDeliveryResult<DeliveryStats> {
        let filter = DeliveryFilter {
            limit: None,
            ..filter.clone()
        };
        let records = self.store.list(&filter).await?;
        let mut stats = compute_stats(&records);
        stats.window_start = filter.since;
        stats.window_end = filter.until;
        Ok(stats)
    }

    /// Health of `endpoint_id` over the last `window`
    #[instrument(skip(self), fields(endpoint_id = %endpoint_id))]
    pub async fn get_endpoint_health(
        &self,
        endpoint_id: Uuid,
        window: Duration,
    ) -> WebhookDeliveryResult<EndpointHealth> {
        let now = Utc::now();
        let since = now
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365));
        let filter = DeliveryFilter {
            since: Some(since),
            until: Some(now),
            ..DeliveryFilter::for_endpoint(endpoint_id)
        };

        let records = self.store.list(&filter).await?;
        let mut stats = compute_stats(&records);
        stats.window_start = Some(since);
        stats.window_end = Some(now);

        let mut attempted: Vec<&DeliveryRecord> = records
            .iter()
            .filter(|record| last_attempt_failed(record).is_some())
            .collect();
        attempted.sort_by(|a, b| b.last_attempt_at.cmp(&a.last_attempt_at));

        let consecutive_failures = attempted
            .iter()
            .take_while(|record| last_attempt_failed(record) == Some(true))
            .count() as u32;
        let last_success_at = attempted
            .iter()
            .find(|record| last_attempt_failed(record) == Some(false))
            .and_then(|record| record.last_attempt_at);
        let last_failure_at = attempted
            .iter()
            .find(|record| last_attempt_failed(record) == Some(true))
            .and_then(|record| record.last_attempt_at);

        Ok(EndpointHealth {
            endpoint_id,
            verdict: self.thresholds.verdict(&stats, consecutive_failures),
            consecutive_failures,
            last_success_at,
            last_failure_at,
            stats,
        })
    }
}

/// Whether the most recent executed attempt of `record` failed; `None` without one
fn last_attempt_failed(record: &DeliveryRecord) -> Option<bool> {
    record.last_attempt_at?;
    match record.status {
        DeliveryStatus::Success => Some(false),
        DeliveryStatus::Retrying | DeliveryStatus::DeadLetter => Some(true),
        // an abandoned delivery never reached the endpoint
        DeliveryStatus::Failed => Some(record.response_status.is_some() || record.attempt_count > 0),
        DeliveryStatus::Pending | DeliveryStatus::Processing => None,
    }
}

/// Short error code of a record's last failure
fn error_code(record: &DeliveryRecord) -> Option<String> {
    match record.response_status {
        Some(status) if !(200..300).contains(&status) => return Some(format!("http_{}", status)),
        Some(_) => return None,
        None => {}
    }
    let message = record.error_message.as_deref()?;
    let code = if message.contains("timed out") || message.contains("timeout") {
        "timeout"
    } else if message.starts_with("endpoint_") {
        message
    } else {
        "transport_error"
    };
    Some(code.to_string())
}

fn compute_stats(records: &[DeliveryRecord]) -> DeliveryStats {
    let mut stats = DeliveryStats {
        total: records.len() as u64,
        ..Default::default()
    };

    let mut errors: HashMap<String, u64> = HashMap::new();
    let mut response_times: Vec<u64> = Vec::new();

    for record in records {
        *stats
            .status_breakdown
            .entry(record.status.as_str().to_string())
            .or_insert(0) += 1;

        match record.status {
            DeliveryStatus::Success => stats.succeeded += 1,
            DeliveryStatus::Failed | DeliveryStatus::DeadLetter => stats.failed += 1,
            _ => stats.in_progress += 1,
        }

        if let Some(ms) = record.response_time_ms {
            response_times.push(ms);
        }
        if record.status != DeliveryStatus::Success {
            if let Some(code) = error_code(record) {
                *errors.entry(code).or_insert(0) += 1;
            }
        }
    }

    let finished = stats.succeeded + stats.failed;
    if finished > 0 {
        stats.success_rate = stats.succeeded as f64 / finished as f64;
    }

    if !response_times.is_empty() {
        response_times.sort_unstable();
        let sum: u64 = response_times.iter().sum();
        stats.avg_response_time_ms = Some(sum as f64 / response_times.len() as f64);
        stats.median_response_time_ms = Some(percentile(&response_times, 0.5));
        stats.p95_response_time_ms = Some(percentile(&response_times, 0.95));
    }

    let mut errors: Vec<ErrorCount> = errors
        .into_iter()
        .map(|(code, count)| ErrorCount { code, count })
        .collect();
    errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));
    errors.truncate(TOP_ERRORS);
    stats.top_errors = errors;

    stats
}

/// Nearest-rank percentile of a sorted, non-empty slice
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
