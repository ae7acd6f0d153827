//! Single delivery attempts
//!
//! [`DeliverySender`] turns one (webhook, envelope) pair into exactly one
//! signed HTTP POST and classifies what happened. It never touches the
//! delivery log; recording the outcome is the caller's job.

use crate::{
    events::WebhookPayload,
    registry::WebhookConfig,
    signature::WebhookSigner,
    transport::{HttpTransport, OutboundRequest},
    Result, WebhookError,
};
use formhook_core::DeliveryConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use std::sync::Arc;
use tracing::{debug, warn};

/// Why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No response: DNS, connect, timeout
    Transport,
    /// Response with a non-2xx status
    HttpStatus,
    /// The webhook cannot be delivered as configured; never retried
    Configuration,
    /// The delivery chain was cancelled
    Cancelled,
}

impl FailureKind {
    /// Whether the retry policy applies to this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport | Self::HttpStatus)
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Success {
        http_status: u16,
        response_body: String,
    },
    Failure {
        http_status: Option<u16>,
        response_body: Option<String>,
        error: String,
        kind: FailureKind,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Success { http_status, .. } => Some(*http_status),
            Self::Failure { http_status, .. } => *http_status,
        }
    }

    pub(crate) fn configuration(error: &WebhookError) -> Self {
        Self::Failure {
            http_status: None,
            response_body: None,
            error: error.to_string(),
            kind: FailureKind::Configuration,
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self::Failure {
            http_status: None,
            response_body: None,
            error: "cancelled".to_string(),
            kind: FailureKind::Cancelled,
        }
    }
}

/// Performs single delivery attempts
pub struct DeliverySender {
    transport: Arc<dyn HttpTransport>,
    config: DeliveryConfig,
    user_agent: String,
}

impl DeliverySender {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: DeliveryConfig,
        user_agent: &str,
    ) -> Self {
        Self {
            transport,
            config,
            user_agent: user_agent.to_string(),
        }
    }

    /// Build the signed request for one envelope.
    ///
    /// Headers are applied in order: `Content-Type`, `User-Agent`, the
    /// signature, then the webhook's static headers. A static header with
    /// the same name replaces the computed one.
    pub fn build_request(
        &self,
        webhook: &WebhookConfig,
        payload: &WebhookPayload,
    ) -> Result<OutboundRequest> {
        let body = payload.to_bytes()?;
        let mut headers = HeaderMap::new();

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, header_value(&self.user_agent)?);

        match webhook.signing_secret() {
            Some(secret) => {
                let signature = WebhookSigner::new(secret)?.header_value(&body)?;
                headers.insert(
                    HeaderName::from_static("x-webhook-signature"),
                    header_value(&signature)?,
                );
            }
            None if self.config.require_signature => {
                return Err(WebhookError::Signing(format!(
                    "webhook {} has no secret and signatures are required",
                    webhook.id
                )));
            }
            None => {}
        }

        for (name, value) in &webhook.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                WebhookError::InvalidConfig(format!("invalid header name: {}", name))
            })?;
            if headers.insert(name.clone(), header_value(value)?).is_some() {
                debug!(
                    webhook_id = %webhook.id,
                    header = %name,
                    "Static webhook header overrides computed header"
                );
            }
        }

        Ok(OutboundRequest {
            url: webhook.url.clone(),
            headers,
            body,
        })
    }

    /// Perform exactly one POST and classify the outcome
    pub async fn send(&self, webhook: &WebhookConfig, payload: &WebhookPayload) -> DeliveryOutcome {
        let request = match self.build_request(webhook, payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    webhook_id = %webhook.id,
                    error = %e,
                    "Webhook cannot be delivered as configured"
                );
                return DeliveryOutcome::configuration(&e);
            }
        };

        match self.transport.post(request).await {
            Ok(response) if response.is_success() => DeliveryOutcome::Success {
                http_status: response.status,
                response_body: self.truncate(response.body),
            },
            Ok(response) => {
                warn!(
                    webhook_id = %webhook.id,
                    url = %webhook.url,
                    status = response.status,
                    "Webhook delivery received non-success response"
                );
                DeliveryOutcome::Failure {
                    http_status: Some(response.status),
                    response_body: Some(self.truncate(response.body)),
                    error: format!("HTTP {}", response.status),
                    kind: FailureKind::HttpStatus,
                }
            }
            Err(e) => {
                warn!(
                    webhook_id = %webhook.id,
                    url = %webhook.url,
                    error = %e,
                    "Webhook delivery failed"
                );
                DeliveryOutcome::Failure {
                    http_status: None,
                    response_body: None,
                    error: e.to_string(),
                    kind: FailureKind::Transport,
                }
            }
        }
    }

    fn truncate(&self, mut body: String) -> String {
        let max = self.config.max_response_body_bytes;
        if body.len() > max {
            let mut cut = max;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        body
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        WebhookError::InvalidConfig("header value contains invalid characters".to_string())
    })
}
