//! HTTP transport capability
//!
//! The engine only needs "POST these bytes, give me status and body or an
//! error". [`ReqwestTransport`] is the production implementation.

use crate::{Result, WebhookError};
use async_trait::async_trait;
use formhook_core::HttpConfig;
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// One outbound webhook request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Status and body of a completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failures; no response was received
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Sends webhook requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST `request.body` to `request.url`
    async fn post(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a transport with the configured timeout
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| WebhookError::Http(e.to_string()))?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(
        &self,
        request: OutboundRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = body_or_empty(response.text().await, &request.url, status);

        Ok(TransportResponse { status, body })
    }
}

/// The status already decides the outcome, so an unreadable body is
/// recorded as empty
fn body_or_empty<E: fmt::Display>(
    body: std::result::Result<String, E>,
    url: &str,
    status: u16,
) -> String {
    match body {
        Ok(body) => body,
        Err(e) => {
            warn!(url = %url, status, error = %e, "Failed to read webhook response body");
            String::new()
        }
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Request(error.to_string())
    }
}
