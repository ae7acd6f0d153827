//! Retry policies and delivery chain scheduling
//!
//! Every delivery runs as one lightweight task (a "chain"): attempt, and on a
//! retryable failure wait out the backoff and attempt again, until the
//! delivery is delivered or the retry budget is spent. Chains are
//! cancellable per delivery, per webhook, and globally on shutdown.

use crate::{
    delivery::{DeliveryStore, DeliveryUpdate},
    events::WebhookPayload,
    registry::WebhookConfig,
    sender::{DeliveryOutcome, DeliverySender},
    Result, WebhookError,
};
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use formhook_core::RetryDefaults;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Retry policy embedded in a webhook configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,
    /// Geometric growth factor between retries
    pub backoff_multiplier: f64,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl From<&RetryDefaults> for RetryPolicy {
    fn from(defaults: &RetryDefaults) -> Self {
        Self {
            max_retries: defaults.max_retries,
            backoff_multiplier: defaults.backoff_multiplier,
            initial_delay_ms: defaults.initial_delay_ms,
            max_delay_ms: defaults.max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before the `retry`-th retry (1-indexed):
    /// `min(initial_delay_ms * backoff_multiplier^(retry-1), max_delay_ms)`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = (retry - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if base.is_finite() {
            base.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };

        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made <= self.max_retries
    }

    /// Total attempts a delivery may make
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(WebhookError::InvalidConfig(format!(
                "backoff multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(WebhookError::InvalidConfig(format!(
                "max delay {}ms is below initial delay {}ms",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }
}

/// Runs delivery chains and owns their cancellation tokens
pub struct RetryScheduler {
    sender: Arc<DeliverySender>,
    store: Arc<DeliveryStore>,
    default_policy: RetryPolicy,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    webhook_tokens: DashMap<String, CancellationToken>,
    active: DashMap<String, CancellationToken>,
    idle: Notify,
}

impl RetryScheduler {
    pub fn new(
        sender: Arc<DeliverySender>,
        store: Arc<DeliveryStore>,
        default_policy: RetryPolicy,
    ) -> Self {
        Self {
            sender,
            store,
            default_policy,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            webhook_tokens: DashMap::new(),
            active: DashMap::new(),
            idle: Notify::new(),
        }
    }

    /// Policy that applies to `webhook`
    pub fn policy_for(&self, webhook: &WebhookConfig) -> RetryPolicy {
        webhook.retry_policy.unwrap_or(self.default_policy)
    }

    /// Reserve the single chain slot of a delivery.
    ///
    /// Fails if a chain for the delivery is already running or the scheduler
    /// is shutting down.
    pub fn claim(&self, delivery_id: &str, webhook_id: &str) -> Result<CancellationToken> {
        if self.shutdown.is_cancelled() {
            return Err(WebhookError::Shutdown);
        }

        match self.active.entry(delivery_id.to_string()) {
            Entry::Occupied(_) => Err(WebhookError::DeliveryInProgress(delivery_id.to_string())),
            Entry::Vacant(slot) => {
                let token = self.webhook_token(webhook_id).child_token();
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    /// Give back a claimed slot without running a chain
    pub fn release(&self, delivery_id: &str) {
        self.vacate(delivery_id);
    }

    /// Start the chain for a claimed delivery
    pub fn launch(
        self: &Arc<Self>,
        token: CancellationToken,
        webhook: WebhookConfig,
        delivery_id: String,
        payload: WebhookPayload,
    ) {
        let scheduler = Arc::clone(self);
        self.tracker.spawn(async move {
            scheduler
                .run_chain(&token, &webhook, &delivery_id, &payload)
                .await;
            scheduler.vacate(&delivery_id);
        });
    }

    /// Claim and launch in one step
    pub fn spawn_chain(
        self: &Arc<Self>,
        webhook: WebhookConfig,
        delivery_id: String,
        payload: WebhookPayload,
    ) -> Result<()> {
        let token = self.claim(&delivery_id, &webhook.id)?;
        self.launch(token, webhook, delivery_id, payload);
        Ok(())
    }

    /// Whether a chain for the delivery is running
    pub fn is_active(&self, delivery_id: &str) -> bool {
        self.active.contains_key(delivery_id)
    }

    /// Number of running chains
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Cancel one running chain
    pub fn cancel_delivery(&self, delivery_id: &str) -> bool {
        match self.active.get(delivery_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every chain of a webhook, e.g. after it was removed
    pub fn cancel_webhook(&self, webhook_id: &str) {
        if let Some((_, token)) = self.webhook_tokens.remove(webhook_id) {
            info!(webhook_id = %webhook_id, "Cancelling pending deliveries of webhook");
            token.cancel();
        }
    }

    /// Token cancelled when the scheduler shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until no chain is running.
    ///
    /// Any number of callers may wait at once.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a wakeup in between is not lost
            let notified = self.idle.notified();
            if self.active.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Cancel all chains and wait for them to record their final state
    pub async fn shutdown(&self) {
        info!(active = self.active.len(), "Shutting down delivery scheduler");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn vacate(&self, delivery_id: &str) {
        self.active.remove(delivery_id);
        if self.active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn webhook_token(&self, webhook_id: &str) -> CancellationToken {
        self.webhook_tokens
            .entry(webhook_id.to_string())
            .or_insert_with(|| self.shutdown.child_token())
            .clone()
    }

    async fn run_chain(
        &self,
        token: &CancellationToken,
        webhook: &WebhookConfig,
        delivery_id: &str,
        payload: &WebhookPayload,
    ) {
        let policy = self.policy_for(webhook);

        loop {
            if token.is_cancelled() {
                self.finish(delivery_id, cancelled());
                return;
            }

            let attempt = match self.store.increment_attempt(delivery_id) {
                Ok(attempt) => attempt,
                Err(e) => {
                    error!(delivery_id = %delivery_id, error = %e, "Delivery record vanished");
                    return;
                }
            };

            debug!(delivery_id = %delivery_id, attempt, "Dispatching webhook");

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => DeliveryOutcome::cancelled(),
                outcome = self.sender.send(webhook, payload) => outcome,
            };

            let (http_status, response_body, error, kind) = match outcome {
                DeliveryOutcome::Success {
                    http_status,
                    response_body,
                } => {
                    info!(
                        delivery_id = %delivery_id,
                        webhook_id = %webhook.id,
                        attempts = attempt,
                        "Webhook delivered successfully"
                    );
                    self.finish(delivery_id, DeliveryUpdate::delivered(http_status, response_body));
                    return;
                }
                DeliveryOutcome::Failure {
                    http_status,
                    response_body,
                    error,
                    kind,
                } => (http_status, response_body, error, kind),
            };

            if !kind.is_retryable() || !policy.should_retry(attempt) {
                error!(
                    delivery_id = %delivery_id,
                    webhook_id = %webhook.id,
                    attempts = attempt,
                    error = %error,
                    "Webhook delivery failed permanently"
                );
                self.finish(
                    delivery_id,
                    DeliveryUpdate::failed(error, http_status, response_body),
                );
                return;
            }

            let delay = policy.delay_for_retry(attempt);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            warn!(
                delivery_id = %delivery_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Scheduling webhook retry"
            );

            if let Err(e) = self.store.update(
                delivery_id,
                DeliveryUpdate::retrying(error, http_status, response_body, next_retry_at),
            ) {
                error!(delivery_id = %delivery_id, error = %e, "Failed to record retry");
                return;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(delivery_id = %delivery_id, "Pending retry cancelled");
                    self.finish(delivery_id, cancelled());
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(&self, delivery_id: &str, update: DeliveryUpdate) {
        if let Err(e) = self.store.update(delivery_id, update) {
            error!(delivery_id = %delivery_id, error = %e, "Failed to record delivery result");
        }
    }
}

fn cancelled() -> DeliveryUpdate {
    DeliveryUpdate::failed("cancelled".to_string(), None, None)
}
