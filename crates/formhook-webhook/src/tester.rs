//! Ad-hoc webhook tests
//!
//! Sends one synthetic `webhook.test` envelope and reports the outcome to
//! the caller. No delivery record is written and nothing is retried.

use crate::{
    events::{WebhookEventKind, WebhookPayload},
    registry::WebhookConfig,
    sender::{DeliveryOutcome, DeliverySender},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// Outcome of a test send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Single-shot sender for "test this webhook" actions
pub struct WebhookTester {
    sender: Arc<DeliverySender>,
}

impl WebhookTester {
    pub fn new(sender: Arc<DeliverySender>) -> Self {
        Self { sender }
    }

    /// Build the synthetic payload sent by [`WebhookTester::test`]
    pub fn test_payload(webhook: &WebhookConfig) -> WebhookPayload {
        WebhookPayload::build(
            &webhook.form_id,
            WebhookEventKind::WebhookTest,
            json!({
                "message": "This is a test webhook delivery",
                "webhookId": webhook.id,
            }),
            Some(json!({ "source": "webhook-test" })),
        )
    }

    /// Send one test delivery and time it
    pub async fn test(&self, webhook: &WebhookConfig) -> TestResult {
        let payload = Self::test_payload(webhook);
        let started = Instant::now();
        let outcome = self.sender.send(webhook, &payload).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            DeliveryOutcome::Success {
                http_status,
                response_body,
            } => TestResult {
                success: true,
                status_code: Some(http_status),
                response: Some(response_body),
                error: None,
                duration_ms,
            },
            DeliveryOutcome::Failure {
                http_status,
                response_body,
                error,
                ..
            } => TestResult {
                success: false,
                status_code: http_status,
                response: response_body,
                error: Some(error),
                duration_ms,
            },
        };

        info!(
            webhook_id = %webhook.id,
            success = result.success,
            duration_ms = result.duration_ms,
            "Webhook test completed"
        );
        result
    }
}
