//! Integration tests for the formhook-webhook crate against a live HTTP endpoint.

use formhook_core::{AppConfig, InMemoryKeyValueStore};
use formhook_webhook::{
    DeliveryStatus, ReqwestTransport, RetryPolicy, WebhookConfig, WebhookError, WebhookEventKind,
    WebhookRegistry, WebhookService, WebhookVerifier, SIGNATURE_HEADER,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "whsec_integration";

fn quick_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_multiplier: 2.0,
        initial_delay_ms: 50,
        max_delay_ms: 500,
    }
}

fn in_memory_registry() -> Arc<WebhookRegistry> {
    Arc::new(WebhookRegistry::new(
        Arc::new(InMemoryKeyValueStore::new()),
        "webhooks",
    ))
}

fn service(registry: Arc<WebhookRegistry>, config: &AppConfig) -> WebhookService {
    let transport = ReqwestTransport::new(&config.http).expect("Failed to build transport");
    WebhookService::new(registry, Arc::new(transport), config)
}

// ==================== Delivery Tests ====================

#[tokio::test]
async fn test_signed_delivery_received() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(header("x-tenant", "acme"))
        .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = in_memory_registry();
    let webhook = registry
        .upsert(
            WebhookConfig::new("form-1", &format!("{}/hook", server.uri()))
                .with_events([WebhookEventKind::SubmissionCreated])
                .with_secret(Some(SECRET))
                .with_header("X-Tenant", "acme"),
        )
        .await
        .expect("Failed to register webhook");

    let service = service(registry, &AppConfig::default());
    let created = service
        .trigger_webhook(
            "form-1",
            WebhookEventKind::SubmissionCreated,
            json!({ "submissionId": "sub-42", "answers": { "q1": "yes" } }),
        )
        .expect("Failed to trigger");
    assert_eq!(created.len(), 1);

    service.wait_idle().await;

    let delivery = service.deliveries().find(&created[0].id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(delivery.http_status, Some(200));
    assert_eq!(delivery.response.as_deref(), Some("thanks"));
    assert!(delivery.delivered_at.is_some());
    assert_eq!(delivery.webhook_id, webhook.id);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);

    let signature = requests[0]
        .headers
        .get(SIGNATURE_HEADER)
        .expect("Missing signature header")
        .to_str()
        .unwrap()
        .to_string();
    let verifier = WebhookVerifier::new(SECRET).unwrap();
    verifier
        .verify(&requests[0].body, &signature)
        .expect("Signature should verify over the received body");
    assert!(matches!(
        WebhookVerifier::new("whsec_other").unwrap().verify(&requests[0].body, &signature),
        Err(WebhookError::SignatureVerificationFailed(_))
    ));

    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["event"], "submission.created");
    assert_eq!(body["formId"], "form-1");
    assert_eq!(body["data"]["submissionId"], "sub-42");
    assert_eq!(body["metadata"]["source"], "submission");
    assert!(body["id"].as_str().unwrap().starts_with("evt_"));
}

#[tokio::test]
async fn test_unsigned_delivery_has_no_signature_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let registry = in_memory_registry();
    registry
        .upsert(
            WebhookConfig::new("form-1", &server.uri())
                .with_events([WebhookEventKind::FormPublished])
                .with_secret(None),
        )
        .await
        .unwrap();

    let service = service(registry, &AppConfig::default());
    let created = service
        .trigger_webhook("form-1", WebhookEventKind::FormPublished, json!({}))
        .unwrap();
    service.wait_idle().await;

    let delivery = service.deliveries().find(&created[0].id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.http_status, Some(204));

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get(SIGNATURE_HEADER).is_none());
}

// ==================== Retry Tests ====================

#[tokio::test]
async fn test_recovers_after_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("busy"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = in_memory_registry();
    registry
        .upsert(
            WebhookConfig::new("form-1", &server.uri())
                .with_events([WebhookEventKind::SubmissionUpdated])
                .with_retry_policy(quick_policy(2)),
        )
        .await
        .unwrap();

    let service = service(registry, &AppConfig::default());
    let started = std::time::Instant::now();
    let created = service
        .trigger_webhook("form-1", WebhookEventKind::SubmissionUpdated, json!({ "n": 1 }))
        .unwrap();
    service.wait_idle().await;

    let delivery = service.deliveries().find(&created[0].id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempt_count, 3);
    assert!(delivery.error.is_none());
    assert!(delivery.next_retry_at.is_none());

    // 50ms then 100ms of backoff between the three attempts
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .expect(2)
        .mount(&server)
        .await;

    let registry = in_memory_registry();
    let webhook = registry
        .upsert(
            WebhookConfig::new("form-1", &server.uri())
                .with_events([WebhookEventKind::AnalyticsMilestone])
                .with_retry_policy(quick_policy(1)),
        )
        .await
        .unwrap();

    let service = service(registry, &AppConfig::default());
    service
        .trigger_webhook("form-1", WebhookEventKind::AnalyticsMilestone, json!({}))
        .unwrap();
    service.wait_idle().await;

    let deliveries = service.deliveries_for_webhook(&webhook.id);
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
    assert_eq!(deliveries[0].attempt_count, 2);
    assert_eq!(deliveries[0].http_status, Some(503));
    assert_eq!(deliveries[0].response.as_deref(), Some("down"));
    assert_eq!(deliveries[0].error.as_deref(), Some("HTTP 503"));

    let stats = service.delivery_stats(&webhook.id);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 0.0);
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let mut config = AppConfig::default();
    config.http = config.http.with_timeout(1);

    let registry = in_memory_registry();
    registry
        .upsert(
            WebhookConfig::new("form-1", &server.uri())
                .with_events([WebhookEventKind::SubmissionDeleted])
                .with_retry_policy(quick_policy(0)),
        )
        .await
        .unwrap();

    let service = service(registry, &config);
    let created = service
        .trigger_webhook("form-1", WebhookEventKind::SubmissionDeleted, json!({}))
        .unwrap();
    service.wait_idle().await;

    let delivery = service.deliveries().find(&created[0].id).unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_count, 1);
    assert!(delivery.http_status.is_none());
    assert!(delivery.error.is_some());
}

// ==================== Tester Tests ====================

#[tokio::test]
async fn test_webhook_test_send() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
        .mount(&server)
        .await;

    let registry = in_memory_registry();
    let webhook = registry
        .upsert(WebhookConfig::new("form-9", &server.uri()).with_secret(Some(SECRET)))
        .await
        .unwrap();

    let service = service(registry, &AppConfig::default());
    let result = service.test_webhook(&webhook.id).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.status_code, Some(418));
    assert_eq!(result.response.as_deref(), Some("teapot"));
    assert!(service.deliveries_for_webhook(&webhook.id).is_empty());

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["event"], "webhook.test");
    assert_eq!(body["data"]["webhookId"], webhook.id.as_str());
    assert_eq!(body["metadata"]["source"], "webhook-test");
}

#[tokio::test]
async fn test_concurrent_test_sends() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(8)
        .mount(&server)
        .await;

    let registry = in_memory_registry();
    let mut ids = Vec::new();
    for i in 0..8 {
        let webhook = registry
            .upsert(WebhookConfig::new(&format!("form-{}", i), &server.uri()))
            .await
            .unwrap();
        ids.push(webhook.id);
    }

    let service = service(registry, &AppConfig::default());
    let results = futures::future::join_all(ids.iter().map(|id| service.test_webhook(id))).await;

    assert_eq!(results.len(), 8);
    for result in results {
        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.status_code, Some(200));
    }
}

// ==================== Persistence Tests ====================

#[tokio::test]
async fn test_service_reloads_registry_from_file() {
    let path = std::env::temp_dir().join(format!(
        "formhook-service-{}.json",
        uuid::Uuid::new_v4().simple()
    ));

    let mut config = AppConfig::default();
    config.storage.path = Some(path.clone());

    let first = WebhookService::from_config(&config).await.unwrap();
    let webhook = first
        .registry()
        .upsert(
            WebhookConfig::new("form-1", "https://hooks.example.com/in")
                .with_events([WebhookEventKind::FormPublished]),
        )
        .await
        .unwrap();
    first.shutdown().await;

    let second = WebhookService::from_config(&config).await.unwrap();
    let reloaded = second.registry().get(&webhook.id).expect("Webhook should persist");
    assert_eq!(reloaded.url, webhook.url);
    assert_eq!(reloaded.secret, webhook.secret);
    assert!(reloaded.subscribes_to(WebhookEventKind::FormPublished));
    second.shutdown().await;

    let document: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(document["webhooks"][0]["id"], webhook.id.as_str());

    let _ = std::fs::remove_file(&path);
}
