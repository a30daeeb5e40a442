//! PostgreSQL endpoint and delivery stores
//!
//! Runtime-checked `sqlx` queries against the tables created by
//! `migrations/0001_webhooks.sql`. JSON-shaped columns (headers, triggers,
//! conditions, retry policy, payload) are stored as JSONB.

use super::{ensure_attempt_bound, DeliveryStore, EndpointStore};
use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::models::{
    DeliveryAttempt, DeliveryFilter, DeliveryRecord, StatusGuard, WebhookEndpoint,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, instrument};
use uuid::Uuid;

const ENDPOINT_COLUMNS: &str = "id, tenant_id, name, url, method, headers, triggers, conditions, \
     secret, active, retry_policy, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, webhook_endpoint_id, tenant_id, event_type, idempotency_key, \
     payload, status, attempt_count, max_attempts, created_at, first_attempt_at, last_attempt_at, \
     next_attempt_at, completed_at, response_status, response_body, response_time_ms, error_message";

/// Apply the bundled migrations
pub async fn run_migrations(pool: &PgPool) -> WebhookDeliveryResult<()> {
    info!("Running webhook delivery migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| WebhookDeliveryError::internal(format!("migration failed: {}", e)))
}

fn endpoint_from_row(row: &PgRow) -> WebhookDeliveryResult<WebhookEndpoint> {
    let method: String = row.try_get("method")?;
    Ok(WebhookEndpoint {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        method: method.parse().map_err(WebhookDeliveryError::internal)?,
        headers: row.try_get::<Json<_>, _>("headers")?.0,
        triggers: row.try_get::<Json<_>, _>("triggers")?.0,
        conditions: row
            .try_get::<Option<Json<_>>, _>("conditions")?
            .map(|conditions| conditions.0),
        secret: row.try_get("secret")?,
        active: row.try_get("active")?,
        retry_policy: row.try_get::<Json<_>, _>("retry_policy")?.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> WebhookDeliveryResult<DeliveryRecord> {
    let status: String = row.try_get("status")?;
    Ok(DeliveryRecord {
        id: row.try_get("id")?,
        webhook_endpoint_id: row.try_get("webhook_endpoint_id")?,
        tenant_id: row.try_get("tenant_id")?,
        event_type: row.try_get("event_type")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: row.try_get("payload")?,
        status: status.parse().map_err(WebhookDeliveryError::internal)?,
        attempt_count: row.try_get::<i32, _>("attempt_count")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        created_at: row.try_get("created_at")?,
        first_attempt_at: row.try_get("first_attempt_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        completed_at: row.try_get("completed_at")?,
        response_status: row
            .try_get::<Option<i32>, _>("response_status")?
            .map(|status| status as u16),
        response_body: row.try_get("response_body")?,
        response_time_ms: row
            .try_get::<Option<i64>, _>("response_time_ms")?
            .map(|ms| ms as u64),
        error_message: row.try_get("error_message")?,
    })
}

/// Endpoint store over `webhook_endpoints`
#[derive(Debug, Clone)]
pub struct PostgresEndpointStore {
    pool: PgPool,
}

impl PostgresEndpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EndpointStore for PostgresEndpointStore {
    #[instrument(skip(self, endpoint), fields(endpoint_id = %endpoint.id))]
    async fn insert(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_endpoints
                (id, tenant_id, name, url, method, headers, triggers, conditions,
                 secret, active, retry_policy, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.tenant_id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(endpoint.method.as_str())
        .bind(Json(&endpoint.headers))
        .bind(Json(&endpoint.triggers))
        .bind(endpoint.conditions.as_ref().map(Json))
        .bind(&endpoint.secret)
        .bind(endpoint.active)
        .bind(Json(&endpoint.retry_policy))
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, endpoint), fields(endpoint_id = %endpoint.id))]
    async fn update(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_endpoints
            SET name = $2, url = $3, method = $4, headers = $5, triggers = $6,
                conditions = $7, secret = $8, active = $9, retry_policy = $10, updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(endpoint.id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(endpoint.method.as_str())
        .bind(Json(&endpoint.headers))
        .bind(Json(&endpoint.triggers))
        .bind(endpoint.conditions.as_ref().map(Json))
        .bind(&endpoint.secret)
        .bind(endpoint.active)
        .bind(Json(&endpoint.retry_policy))
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WebhookDeliveryError::not_found(format!(
                "Webhook endpoint {}",
                endpoint.id
            )));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> WebhookDeliveryResult<bool> {
        let result = sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<WebhookEndpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_endpoints WHERE id = $1",
            ENDPOINT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(endpoint_from_row).transpose()
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> WebhookDeliveryResult<Vec<WebhookEndpoint>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM webhook_endpoints WHERE tenant_id = $1 ORDER BY created_at",
            ENDPOINT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(endpoint_from_row).collect()
    }
}

/// Delivery store over `webhook_deliveries`
#[derive(Debug, Clone)]
pub struct PostgresDeliveryStore {
    pool: PgPool,
}

impl PostgresDeliveryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    #[instrument(skip(self, record), fields(delivery_id = %record.id))]
    async fn create_if_absent(
        &self,
        record: DeliveryRecord,
    ) -> WebhookDeliveryResult<(DeliveryRecord, bool)> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO webhook_deliveries
                (id, webhook_endpoint_id, tenant_id, event_type, idempotency_key, payload,
                 status, attempt_count, max_attempts, created_at, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(record.id)
        .bind(record.webhook_endpoint_id)
        .bind(&record.tenant_id)
        .bind(&record.event_type)
        .bind(&record.idempotency_key)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.attempt_count as i32)
        .bind(record.max_attempts as i32)
        .bind(record.created_at)
        .bind(record.next_attempt_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((delivery_from_row(&row)?, true));
        }

        let existing = self
            .find_by_idempotency_key(&record.idempotency_key)
            .await?
            .ok_or_else(|| {
                WebhookDeliveryError::internal(format!(
                    "idempotency key {} conflicted but no record was found",
                    record.idempotency_key
                ))
            })?;
        Ok((existing, false))
    }

    async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<DeliveryRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_deliveries WHERE id = $1",
            DELIVERY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> WebhookDeliveryResult<Option<DeliveryRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM webhook_deliveries WHERE idempotency_key = $1",
            DELIVERY_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(delivery_from_row).transpose()
    }

    #[instrument(skip(self, guard, attempt), fields(delivery_id = %id, status = %attempt.status))]
    async fn update_delivery_attempt(
        &self,
        id: Uuid,
        guard: &StatusGuard,
        attempt: DeliveryAttempt,
    ) -> WebhookDeliveryResult<Option<DeliveryRecord>> {
        let expected: Vec<String> = guard
            .expected
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE webhook_deliveries
            SET status = $2, attempt_count = $3, first_attempt_at = $4, last_attempt_at = $5,
                next_attempt_at = $6, completed_at = $7, response_status = $8,
                response_body = $9, response_time_ms = $10, error_message = $11
            WHERE id = $1
              AND status = ANY($12)
              AND ($13::int4 IS NULL OR attempt_count = $13)
              AND ($14::timestamptz IS NULL
                   OR status <> 'retrying'
                   OR next_attempt_at IS NULL
                   OR next_attempt_at <= $14)
              AND ($15::timestamptz IS NULL
                   OR status <> 'processing'
                   OR last_attempt_at IS NULL
                   OR last_attempt_at <= $15)
              AND $3 <= max_attempts
            RETURNING {}
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(id)
        .bind(attempt.status.as_str())
        .bind(attempt.attempt_count as i32)
        .bind(attempt.first_attempt_at)
        .bind(attempt.last_attempt_at)
        .bind(attempt.next_attempt_at)
        .bind(attempt.completed_at)
        .bind(attempt.response_status.map(i32::from))
        .bind(&attempt.response_body)
        .bind(attempt.response_time_ms.map(|ms| ms as i64))
        .bind(&attempt.error_message)
        .bind(&expected)
        .bind(guard.attempt_count.map(|count| count as i32))
        .bind(guard.due_by)
        .bind(guard.claimed_before)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Some(delivery_from_row(&row)?));
        }

        // Distinguish a lost race from a missing record or an attempt overflow
        match self.get(id).await? {
            None => Err(WebhookDeliveryError::not_found(format!("Delivery {}", id))),
            Some(current) if guard.admits(&current) => {
                ensure_attempt_bound(id, current.max_attempts, &attempt)?;
                Ok(None)
            }
            Some(_) => Ok(None),
        }
    }

    async fn list(&self, filter: &DeliveryFilter) -> WebhookDeliveryResult<Vec<DeliveryRecord>> {
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM webhook_deliveries WHERE TRUE",
            DELIVERY_COLUMNS
        ));

        if let Some(tenant_id) = &filter.tenant_id {
            query.push(" AND tenant_id = ").push_bind(tenant_id.clone());
        }
        if let Some(endpoint_id) = filter.endpoint_id {
            query.push(" AND webhook_endpoint_id = ").push_bind(endpoint_id);
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str().to_string());
        }
        if let Some(since) = filter.since {
            query.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            query.push(" AND created_at < ").push_bind(until);
        }
        query.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> WebhookDeliveryResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_deliveries
            WHERE status IN ('success', 'failed', 'dead_letter')
              AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
