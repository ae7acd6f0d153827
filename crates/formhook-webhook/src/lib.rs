//! Webhook event delivery for formhook
//!
//! When a domain event happens (a submission is created, a form is
//! published, ...) every active webhook subscribed to that event for the
//! form receives a signed HTTP POST. Failed attempts are retried with
//! bounded exponential backoff until the webhook's retry budget runs out.
//!
//! # Features
//!
//! - **Registry**: webhook configurations with key-value persistence and
//!   change notification
//! - **Signing**: HMAC-SHA256 over the exact bytes sent
//! - **Delivery log**: per-delivery status with an enforced state machine
//! - **Retry scheduling**: one task per delivery chain, cancellable per
//!   webhook and on shutdown
//! - **Testing**: single-shot sends for "test this webhook" actions
//!
//! # Example
//!
//! ```rust,ignore
//! use formhook_core::AppConfig;
//! use formhook_webhook::{WebhookConfig, WebhookEventKind, WebhookService};
//!
//! let service = WebhookService::from_config(&AppConfig::load()?).await?;
//!
//! let config = WebhookConfig::new("form-1", "https://example.com/hook")
//!     .with_events([WebhookEventKind::SubmissionCreated]);
//! service.registry().upsert(config).await?;
//!
//! let deliveries = service.trigger_webhook(
//!     "form-1",
//!     WebhookEventKind::SubmissionCreated,
//!     serde_json::json!({ "submissionId": "sub-1" }),
//! )?;
//! ```

pub mod events;
pub mod signature;
pub mod retry;
pub mod registry;
pub mod delivery;
pub mod transport;
pub mod sender;
pub mod tester;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use delivery::*;
pub use events::*;
pub use registry::*;
pub use retry::*;
pub use sender::*;
pub use signature::*;
pub use tester::*;
pub use transport::*;
pub use trigger::*;

use formhook_core::StoreError;
use thiserror::Error;

/// Webhook errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook not found: {0}")]
    NotFound(String),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    #[error("Delivery already exists: {0}")]
    DuplicateDelivery(String),

    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid webhook configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid delivery transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Delivery already in progress: {0}")]
    DeliveryInProgress(String),

    #[error("Signature error: {0}")]
    Signing(String),

    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery engine is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, WebhookError>;
