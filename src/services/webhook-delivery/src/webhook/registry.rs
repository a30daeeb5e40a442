//! # Webhook Registry
//!
//! Owns endpoint configuration. Writes are validated and persisted through an
//! [`EndpointStore`]; lookups for the dispatcher go through a per-registry cache keyed
//! by (tenant, model, event) that expires after a TTL and is dropped for a tenant on
//! any write to that tenant's endpoints.
//!
//! Each tenant also has a generation number bumped on every write. A lookup only
//! caches its result if the generation it started with is still current, so a
//! lookup racing a write cannot re-insert the pre-write snapshot.

use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use crate::models::{
    normalize_action, NewWebhookEndpoint, RetryPolicy, Triggers, WebhookEndpoint,
    WebhookEndpointPatch,
};
use crate::security::{headers, SecurityUtils};
use crate::storage::EndpointStore;
use crate::utils::UrlUtils;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Headers an endpoint may not override
const RESERVED_HEADERS: [&str; 5] = [
    "content-type",
    headers::SIGNATURE,
    headers::EVENT,
    headers::DELIVERY,
    headers::TIMESTAMP,
];

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub cache_ttl: Duration,
    pub require_https: bool,
    pub default_retry_policy: RetryPolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            require_https: false,
            default_retry_policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: String,
    model: String,
    event: String,
}

#[derive(Debug, Clone)]
struct CachedEndpoints {
    endpoints: Arc<Vec<WebhookEndpoint>>,
    cached_at: Instant,
}

/// Endpoint registry with a TTL cache for event lookups
pub struct WebhookRegistry {
    store: Arc<dyn EndpointStore>,
    cache: DashMap<CacheKey, CachedEndpoints>,
    generations: DashMap<String, u64>,
    settings: RegistrySettings,
}

impl WebhookRegistry {
    pub fn new(store: Arc<dyn EndpointStore>, settings: RegistrySettings) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            generations: DashMap::new(),
            settings,
        }
    }

    /// Validate and persist a new endpoint with a freshly generated secret
    #[instrument(skip(self, config), fields(tenant_id = %config.tenant_id))]
    pub async fn register(&self, config: NewWebhookEndpoint) -> WebhookDeliveryResult<WebhookEndpoint> {
        if config.tenant_id.trim().is_empty() {
            return Err(WebhookDeliveryError::configuration("tenant id is required"));
        }
        validate_name(&config.name)?;
        UrlUtils::validate_endpoint_url(&config.url, self.settings.require_https)?;
        let triggers = normalize_triggers(config.triggers)?;
        validate_headers(&config.headers)?;
        let retry_policy = config
            .retry_policy
            .unwrap_or_else(|| self.settings.default_retry_policy.clone());
        validate_retry_policy(&retry_policy)?;

        let now = Utc::now();
        let endpoint = WebhookEndpoint {
            id: Uuid::new_v4(),
            tenant_id: config.tenant_id,
            name: config.name.trim().to_string(),
            url: config.url,
            method: config.method.unwrap_or_default(),
            headers: config.headers,
            triggers,
            conditions: config.conditions,
            secret: SecurityUtils::generate_secret(),
            active: config.active.unwrap_or(true),
            retry_policy,
            created_at: now,
            updated_at: now,
        };

        self.store.insert(&endpoint).await?;
        self.invalidate_tenant(&endpoint.tenant_id);

        info!(endpoint_id = %endpoint.id, name = %endpoint.name, "Registered webhook endpoint");
        Ok(endpoint)
    }

    /// Apply a partial update; the secret cannot be changed here
    #[instrument(skip(self, patch), fields(endpoint_id = %id))]
    pub async fn update(
        &self,
        id: Uuid,
        patch: WebhookEndpointPatch,
    ) -> WebhookDeliveryResult<WebhookEndpoint> {
        let mut endpoint = self.require(id).await?;

        if let Some(name) = patch.name {
            validate_name(&name)?;
            endpoint.name = name.trim().to_string();
        }
        if let Some(url) = patch.url {
            UrlUtils::validate_endpoint_url(&url, self.settings.require_https)?;
            endpoint.url = url;
        }
        if let Some(method) = patch.method {
            endpoint.method = method;
        }
        if let Some(headers) = patch.headers {
            validate_headers(&headers)?;
            endpoint.headers = headers;
        }
        if let Some(triggers) = patch.triggers {
            endpoint.triggers = normalize_triggers(triggers)?;
        }
        if let Some(conditions) = patch.conditions {
            endpoint.conditions = conditions;
        }
        if let Some(active) = patch.active {
            endpoint.active = active;
        }
        if let Some(retry_policy) = patch.retry_policy {
            validate_retry_policy(&retry_policy)?;
            endpoint.retry_policy = retry_policy;
        }

        self.save(endpoint).await
    }

    /// Replace the endpoint secret with a new random one
    #[instrument(skip(self), fields(endpoint_id = %id))]
    pub async fn rotate_secret(&self, id: Uuid) -> WebhookDeliveryResult<WebhookEndpoint> {
        let mut endpoint = self.require(id).await?;
        endpoint.secret = SecurityUtils::generate_secret();
        let endpoint = self.save(endpoint).await?;
        info!("Rotated webhook endpoint secret");
        Ok(endpoint)
    }

    /// Stop matching new events; queued deliveries are left alone
    pub async fn deactivate(&self, id: Uuid) -> WebhookDeliveryResult<WebhookEndpoint> {
        let mut endpoint = self.require(id).await?;
        endpoint.active = false;
        self.save(endpoint).await
    }

    pub async fn delete(&self, id: Uuid) -> WebhookDeliveryResult<()> {
        let endpoint = self.require(id).await?;
        if !self.store.delete(id).await? {
            return Err(WebhookDeliveryError::not_found(format!("Webhook endpoint {}", id)));
        }
        self.invalidate_tenant(&endpoint.tenant_id);
        info!(endpoint_id = %id, "Deleted webhook endpoint");
        Ok(())
    }

    /// Fresh, uncached read
    pub async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<WebhookEndpoint>> {
        self.store.get(id).await
    }

    pub async fn list(&self, tenant_id: &str) -> WebhookDeliveryResult<Vec<WebhookEndpoint>> {
        self.store.list_by_tenant(tenant_id).await
    }

    /// Active endpoints of `tenant_id` whose triggers enable `model`/`event`
    pub async fn find_active_for_event(
        &self,
        tenant_id: &str,
        model: &str,
        event: &str,
    ) -> WebhookDeliveryResult<Arc<Vec<WebhookEndpoint>>> {
        let key = CacheKey {
            tenant_id: tenant_id.to_string(),
            model: model.to_lowercase(),
            event: event.to_lowercase(),
        };

        if let Some(cached) = self.cache.get(&key) {
            if cached.cached_at.elapsed() < self.settings.cache_ttl {
                return Ok(cached.endpoints.clone());
            }
        }

        let generation = *self
            .generations
            .entry(tenant_id.to_string())
            .or_insert(0);

        let action = normalize_action(event);
        let endpoints: Vec<WebhookEndpoint> = self
            .store
            .list_by_tenant(tenant_id)
            .await?
            .into_iter()
            .filter(|endpoint| endpoint.active && endpoint.is_triggered_by(model, &action, event))
            .collect();
        let endpoints = Arc::new(endpoints);

        debug!(
            tenant_id = %tenant_id,
            model = %key.model,
            event = %key.event,
            matched = endpoints.len(),
            "Resolved endpoints for event"
        );

        // Holding the generation guard blocks a concurrent invalidation until the insert is done
        if let Some(current) = self.generations.get(tenant_id) {
            if *current == generation {
                self.cache.insert(
                    key,
                    CachedEndpoints {
                        endpoints: endpoints.clone(),
                        cached_at: Instant::now(),
                    },
                );
            } else {
                debug!(tenant_id = %tenant_id, "Endpoints changed during lookup, result not cached");
            }
        }
        Ok(endpoints)
    }

    /// Drop every cached lookup for `tenant_id`
    pub fn invalidate_tenant(&self, tenant_id: &str) {
        *self.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
        self.cache.retain(|key, _| key.tenant_id != tenant_id);
    }

    async fn require(&self, id: Uuid) -> WebhookDeliveryResult<WebhookEndpoint> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| WebhookDeliveryError::not_found(format!("Webhook endpoint {}", id)))
    }

    async fn save(&self, mut endpoint: WebhookEndpoint) -> WebhookDeliveryResult<WebhookEndpoint> {
        endpoint.updated_at = Utc::now();
        self.store.update(&endpoint).await?;
        self.invalidate_tenant(&endpoint.tenant_id);
        Ok(endpoint)
    }
}

fn validate_name(name: &str) -> WebhookDeliveryResult<()> {
    if name.trim().is_empty() {
        return Err(WebhookDeliveryError::configuration("endpoint name is required"));
    }
    Ok(())
}

/// Lower-case model and action keys; at least one trigger must be enabled
fn normalize_triggers(triggers: Triggers) -> WebhookDeliveryResult<Triggers> {
    let mut normalized: Triggers = HashMap::new();
    for (model, actions) in triggers {
        let entry = normalized.entry(model.trim().to_lowercase()).or_default();
        for (action, enabled) in actions {
            let slot = entry.entry(action.trim().to_lowercase()).or_insert(false);
            *slot |= enabled;
        }
    }

    let any_enabled = normalized
        .values()
        .any(|actions| actions.values().any(|enabled| *enabled));
    if !any_enabled {
        return Err(WebhookDeliveryError::configuration(
            "at least one trigger must be enabled",
        ));
    }
    Ok(normalized)
}

fn validate_headers(custom: &HashMap<String, String>) -> WebhookDeliveryResult<()> {
    for (name, value) in custom {
        if RESERVED_HEADERS
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
        {
            return Err(WebhookDeliveryError::configuration(format!(
                "header '{}' is set by the delivery service and cannot be overridden",
                name
            )));
        }
        if reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(WebhookDeliveryError::configuration(format!(
                "invalid header name '{}'",
                name
            )));
        }
        if reqwest::header::HeaderValue::from_str(value).is_err() {
            return Err(WebhookDeliveryError::configuration(format!(
                "invalid value for header '{}'",
                name
            )));
        }
    }
    Ok(())
}

fn validate_retry_policy(policy: &RetryPolicy) -> WebhookDeliveryResult<()> {
    if policy.max_attempts == 0 {
        return Err(WebhookDeliveryError::configuration(
            "retryPolicy.maxAttempts must be at least 1",
        ));
    }
    if policy.initial_delay_ms == 0 || policy.initial_delay_ms > policy.max_delay_ms {
        return Err(WebhookDeliveryError::configuration(
            "retryPolicy.initialDelay must be positive and not exceed maxDelay",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEndpointStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Returns the tenant listing as of the call, after a delay
    struct SlowListStore {
        inner: MemoryEndpointStore,
        delay: Duration,
    }

    #[async_trait]
    impl EndpointStore for SlowListStore {
        async fn insert(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()> {
            self.inner.insert(endpoint).await
        }

        async fn update(&self, endpoint: &WebhookEndpoint) -> WebhookDeliveryResult<()> {
            self.inner.update(endpoint).await
        }

        async fn delete(&self, id: Uuid) -> WebhookDeliveryResult<bool> {
            self.inner.delete(id).await
        }

        async fn get(&self, id: Uuid) -> WebhookDeliveryResult<Option<WebhookEndpoint>> {
            self.inner.get(id).await
        }

        async fn list_by_tenant(
            &self,
            tenant_id: &str,
        ) -> WebhookDeliveryResult<Vec<WebhookEndpoint>> {
            let snapshot = self.inner.list_by_tenant(tenant_id).await?;
            tokio::time::sleep(self.delay).await;
            Ok(snapshot)
        }
    }

    fn registry() -> WebhookRegistry {
        WebhookRegistry::new(Arc::new(MemoryEndpointStore::new()), RegistrySettings::default())
    }

    fn new_endpoint(tenant: &str) -> NewWebhookEndpoint {
        serde_json::from_value(json!({
            "tenantId": tenant,
            "name": "CRM sync",
            "url": "https://hooks.example.com/crm",
            "triggers": {"User": {"Create": true, "delete": false}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_normalizes_and_generates_secret() {
        let registry = registry();
        let endpoint = registry.register(new_endpoint("t1")).await.unwrap();

        assert!(endpoint.secret.starts_with("whsec_"));
        assert!(endpoint.active);
        assert_eq!(endpoint.triggers["user"]["create"], true);
        assert_eq!(endpoint.retry_policy, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let registry = registry();

        let mut bad_url = new_endpoint("t1");
        bad_url.url = "ftp://example.com".to_string();
        assert!(matches!(
            registry.register(bad_url).await,
            Err(WebhookDeliveryError::Configuration { .. })
        ));

        let mut no_triggers = new_endpoint("t1");
        no_triggers.triggers = HashMap::new();
        assert!(registry.register(no_triggers).await.is_err());

        let mut reserved = new_endpoint("t1");
        reserved
            .headers
            .insert("x-webhook-signature-256".to_string(), "forged".to_string());
        assert!(registry.register(reserved).await.is_err());
    }

    #[tokio::test]
    async fn test_https_required_when_configured() {
        let registry = WebhookRegistry::new(
            Arc::new(MemoryEndpointStore::new()),
            RegistrySettings {
                require_https: true,
                ..RegistrySettings::default()
            },
        );
        let mut endpoint = new_endpoint("t1");
        endpoint.url = "http://hooks.example.com".to_string();

        assert!(registry.register(endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_find_active_for_event_matches_triggers() {
        let registry = registry();
        let endpoint = registry.register(new_endpoint("t1")).await.unwrap();

        let found = registry
            .find_active_for_event("t1", "User", "created")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, endpoint.id);

        assert!(registry
            .find_active_for_event("t1", "User", "deleted")
            .await
            .unwrap()
            .is_empty());
        assert!(registry
            .find_active_for_event("t2", "User", "created")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_writes_invalidate_cached_lookups() {
        let registry = registry();
        let endpoint = registry.register(new_endpoint("t1")).await.unwrap();

        assert_eq!(
            registry
                .find_active_for_event("t1", "user", "created")
                .await
                .unwrap()
                .len(),
            1
        );

        registry.deactivate(endpoint.id).await.unwrap();
        assert!(registry
            .find_active_for_event("t1", "user", "created")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lookup_racing_register_does_not_cache_old_snapshot() {
        let registry = Arc::new(WebhookRegistry::new(
            Arc::new(SlowListStore {
                inner: MemoryEndpointStore::new(),
                delay: Duration::from_millis(100),
            }),
            RegistrySettings::default(),
        ));

        let lookup = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .find_active_for_event("t1", "user", "created")
                    .await
                    .unwrap()
                    .len()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(new_endpoint("t1")).await.unwrap();

        assert_eq!(lookup.await.unwrap(), 0);
        let after = registry
            .find_active_for_event("t1", "user", "created")
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
    }

    #[tokio::test]
    async fn test_header_values_are_validated() {
        let registry = registry();
        let mut endpoint = new_endpoint("t1");
        endpoint
            .headers
            .insert("x-team".to_string(), "ops\r\nx-injected: 1".to_string());

        assert!(matches!(
            registry.register(endpoint).await,
            Err(WebhookDeliveryError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_secret_and_rotation_changes_it() {
        let registry = registry();
        let endpoint = registry.register(new_endpoint("t1")).await.unwrap();

        let updated = registry
            .update(
                endpoint.id,
                WebhookEndpointPatch {
                    name: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.secret, endpoint.secret);

        let rotated = registry.rotate_secret(endpoint.id).await.unwrap();
        assert_ne!(rotated.secret, endpoint.secret);
        assert_eq!(
            registry.get(endpoint.id).await.unwrap().unwrap().secret,
            rotated.secret
        );
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_endpoint() {
        let registry = registry();
        let missing = Uuid::new_v4();

        assert!(matches!(
            registry.update(missing, WebhookEndpointPatch::default()).await,
            Err(WebhookDeliveryError::NotFound { .. })
        ));
        assert!(matches!(
            registry.delete(missing).await,
            Err(WebhookDeliveryError::NotFound { .. })
        ));
    }
}
