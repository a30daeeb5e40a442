//! HTTP handlers for the AI-CORE Webhook Delivery Service
//!
//! Only the operational surface is served over HTTP: health and Prometheus metrics.
//! Endpoint management is a library facade on [`WebhookService`].

use crate::service::{ServiceStatus, WebhookService};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

/// Create the operational routes
pub fn create_routes(service: Arc<WebhookService>) -> Router {
    let observability = &service.config().observability;
    let mut router = Router::new()
        .route(&observability.health_path, get(health_check))
        .route("/health/live", get(liveness_check));

    if observability.metrics_enabled {
        router = router.route(&observability.metrics_path, get(metrics_handler));
    }

    router.with_state(service)
}

/// Health check endpoint
async fn health_check(State(service): State<Arc<WebhookService>>) -> impl IntoResponse {
    debug!("Health check requested");
    let report = service.health().await;

    let status_code = match report.status {
        ServiceStatus::Healthy | ServiceStatus::Degraded => StatusCode::OK,
        ServiceStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(report))
}

/// Liveness check endpoint (for Kubernetes)
async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "alive"})))
}

/// Metrics endpoint (Prometheus format)
async fn metrics_handler(State(service): State<Arc<WebhookService>>) -> impl IntoResponse {
    match service.metrics().render() {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            text,
        ),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                e.to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookDeliveryConfig;
    use crate::service::ServiceBackends;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let service = WebhookService::with_backends(
            WebhookDeliveryConfig::default(),
            ServiceBackends::in_memory(),
        )
        .unwrap();
        create_routes(Arc::new(service))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
