//! # Integration Tests for Webhook Delivery Service
//!
//! End-to-end flows through the service facade with in-memory backends and a
//! wiremock endpoint: dispatch, signed delivery, retries, dead-lettering and the
//! admin operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use webhook_delivery_service::{
    security::headers,
    webhook::JobDisposition,
    DeliveryStatus, EventContext, LifecycleEvent, NewWebhookEndpoint, RetryPolicy,
    SecurityUtils, ServiceBackends, WebhookDeliveryConfig, WebhookDeliveryError, WebhookEndpoint,
    WebhookService,
};

const TENANT: &str = "tenant-it";

fn create_test_service() -> WebhookService {
    let mut config = WebhookDeliveryConfig::default();
    config.worker.concurrency = 2;
    config.delivery.request_timeout = 5;
    WebhookService::with_backends(config, ServiceBackends::in_memory()).unwrap()
}

/// Retry policy with millisecond delays so retries come due quickly
fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        jitter: false,
        ..RetryPolicy::default()
    }
}

async fn register(
    service: &WebhookService,
    server: &MockServer,
    retry_policy: RetryPolicy,
    conditions: Option<Value>,
) -> WebhookEndpoint {
    service
        .create_endpoint(NewWebhookEndpoint {
            tenant_id: TENANT.to_string(),
            name: "order-sync".to_string(),
            url: format!("{}/hooks/orders", server.uri()),
            triggers: [(
                "order".to_string(),
                [("create".to_string(), true)].into_iter().collect(),
            )]
            .into_iter()
            .collect(),
            conditions: conditions.map(|c| serde_json::from_value(c).unwrap()),
            retry_policy: Some(retry_policy),
            ..Default::default()
        })
        .await
        .unwrap()
}

fn order_created(total: u64) -> LifecycleEvent {
    LifecycleEvent {
        id: None,
        event: "created".to_string(),
        model: "Order".to_string(),
        data: json!({ "id": "ord-1", "total": total }),
        previous: None,
        context: EventContext {
            tenant_id: TENANT.to_string(),
            user_id: Some("user-7".to_string()),
            user_role: Some("admin".to_string()),
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: "orders-api".to_string(),
        },
    }
}

/// Pull jobs through the worker pool until the delivery reaches a terminal status
async fn drive_to_terminal(service: &WebhookService, delivery_id: Uuid) -> DeliveryStatus {
    for _ in 0..50 {
        let status = service.get_delivery(delivery_id).await.unwrap().status;
        if status.is_terminal() {
            return status;
        }
        service
            .worker_pool()
            .process_next(Duration::from_millis(200))
            .await
            .unwrap();
    }
    panic!("delivery {} did not reach a terminal status", delivery_id);
}

#[tokio::test]
async fn test_successful_delivery_is_signed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/orders"))
        .and(header_exists(headers::SIGNATURE))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let service = create_test_service();
    let endpoint = register(&service, &server, RetryPolicy::default(), None).await;

    let summary = service.on_lifecycle_event(&order_created(250)).await;
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.created.len(), 1);
    let delivery_id = summary.created[0];

    let disposition = service
        .worker_pool()
        .process_next(Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(disposition, Some(JobDisposition::Ack));

    let record = service.get_delivery(delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Success);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.response_status, Some(200));
    assert_eq!(record.response_body.as_deref(), Some("ok"));
    assert!(record.completed_at.is_some());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let signature = request.headers.get(headers::SIGNATURE).unwrap().to_str().unwrap();
    assert!(signature.starts_with("sha256="));
    assert!(SecurityUtils::verify_signature(
        &request.body,
        signature,
        &endpoint.secret
    ));
    assert_eq!(
        request.headers.get(headers::EVENT).unwrap().to_str().unwrap(),
        "order.created"
    );
    assert_eq!(
        request.headers.get(headers::DELIVERY).unwrap().to_str().unwrap(),
        delivery_id.to_string()
    );

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["id"], json!(delivery_id));
    assert_eq!(body["type"], "order.created");
    assert_eq!(body["data"]["total"], 250);
    assert_eq!(body["webhook"]["id"], json!(endpoint.id));
    assert_eq!(body["meta"]["tenantId"], TENANT);
}

#[tokio::test]
async fn test_server_errors_exhaust_into_dead_letter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(3)
        .mount(&server)
        .await;

    let service = create_test_service();
    register(&service, &server, fast_retry(3), None).await;

    let summary = service.on_lifecycle_event(&order_created(10)).await;
    let delivery_id = summary.created[0];

    let status = drive_to_terminal(&service, delivery_id).await;
    assert_eq!(status, DeliveryStatus::DeadLetter);

    let record = service.get_delivery(delivery_id).await.unwrap();
    assert_eq!(record.attempt_count, 3);
    assert_eq!(record.response_status, Some(500));
    assert!(record.next_attempt_at.is_none());
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn test_client_error_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let service = create_test_service();
    register(&service, &server, fast_retry(5), None).await;

    let summary = service.on_lifecycle_event(&order_created(10)).await;
    let delivery_id = summary.created[0];

    let status = drive_to_terminal(&service, delivery_id).await;
    assert_eq!(status, DeliveryStatus::Failed);

    let record = service.get_delivery(delivery_id).await.unwrap();
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.response_status, Some(404));
}

#[tokio::test]
async fn test_conditions_filter_out_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let service = create_test_service();
    let endpoint = register(
        &service,
        &server,
        RetryPolicy::default(),
        Some(json!({ "type": "field", "field": "total", "operator": "gt", "value": 100 })),
    )
    .await;

    let summary = service.on_lifecycle_event(&order_created(5)).await;
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.filtered, 1);
    assert!(summary.created.is_empty());

    let deliveries = service.list_deliveries(endpoint.id, None).await.unwrap();
    assert!(deliveries.is_empty());

    let summary = service.on_lifecycle_event(&order_created(500)).await;
    assert_eq!(summary.created.len(), 1);
}

#[tokio::test]
async fn test_duplicate_event_creates_one_delivery() {
    let server = MockServer::start().await;
    let service = create_test_service();
    let endpoint = register(&service, &server, RetryPolicy::default(), None).await;

    let event = order_created(42);
    let first = service.on_lifecycle_event(&event).await;
    let second = service.on_lifecycle_event(&event).await;

    assert_eq!(first.created.len(), 1);
    assert!(second.created.is_empty());
    assert_eq!(second.duplicates, first.created);

    let deliveries = service.list_deliveries(endpoint.id, None).await.unwrap();
    assert_eq!(deliveries.len(), 1);
}

#[tokio::test]
async fn test_concurrent_workers_send_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .expect(1)
        .mount(&server)
        .await;

    let service = create_test_service();
    register(&service, &server, RetryPolicy::default(), None).await;
    let delivery_id = service.on_lifecycle_event(&order_created(1)).await.created[0];

    let (a, b) = tokio::join!(
        service.worker().process(delivery_id),
        service.worker().process(delivery_id)
    );
    let dispositions = [a.unwrap(), b.unwrap()];
    assert!(dispositions.contains(&JobDisposition::Ack));

    let record = service.get_delivery(delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Success);
    assert_eq!(record.attempt_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_racing_on_due_retry_send_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
        .expect(1)
        .mount(&server)
        .await;

    let service = Arc::new(create_test_service());
    register(&service, &server, fast_retry(3), None).await;
    let delivery_id = service.on_lifecycle_event(&order_created(1)).await.created[0];

    service.worker().process(delivery_id).await.unwrap();
    let record = service.get_delivery(delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Retrying);
    assert_eq!(record.attempt_count, 1);

    // let the retry come due
    tokio::time::sleep(Duration::from_millis(100)).await;

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.worker().process(delivery_id).await })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap().unwrap();
    }

    let record = service.get_delivery(delivery_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Success);
    assert_eq!(record.attempt_count, 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_admin_retry_of_dead_letter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let service = create_test_service();
    register(&service, &server, fast_retry(1), None).await;
    let delivery_id = service.on_lifecycle_event(&order_created(1)).await.created[0];

    assert_eq!(
        drive_to_terminal(&service, delivery_id).await,
        DeliveryStatus::DeadLetter
    );

    let reset = service.retry_delivery(delivery_id).await.unwrap();
    assert_eq!(reset.status, DeliveryStatus::Pending);
    assert_eq!(reset.attempt_count, 0);
    assert!(reset.response_status.is_none());
    assert!(reset.error_message.is_none());

    assert_eq!(
        drive_to_terminal(&service, delivery_id).await,
        DeliveryStatus::Success
    );
    let record = service.get_delivery(delivery_id).await.unwrap();
    assert_eq!(record.attempt_count, 1);

    let err = service.retry_delivery(delivery_id).await.unwrap_err();
    assert!(matches!(err, WebhookDeliveryError::InvalidState { .. }));
}

#[tokio::test]
async fn test_endpoint_test_creates_no_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists(headers::SIGNATURE))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let service = create_test_service();
    let endpoint = register(&service, &server, RetryPolicy::default(), None).await;

    let result = service.test_endpoint(endpoint.id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.status_code, Some(204));
    assert!(result.error.is_none());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        requests[0].headers.get(headers::EVENT).unwrap().to_str().unwrap(),
        "webhook.test"
    );

    let deliveries = service.list_deliveries(endpoint.id, None).await.unwrap();
    assert!(deliveries.is_empty());
}

#[tokio::test]
async fn test_delivery_stats_after_mixed_outcomes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let service = create_test_service();
    let endpoint = register(&service, &server, fast_retry(3), None).await;

    for total in [1, 2, 3] {
        let id = service.on_lifecycle_event(&order_created(total)).await.created[0];
        drive_to_terminal(&service, id).await;
    }

    let stats = service
        .delivery_stats(&webhook_delivery_service::DeliveryFilter::for_endpoint(endpoint.id))
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 1);
    assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.top_errors[0].code, "http_410");
}
