//! Event trigger and delivery service
//!
//! [`WebhookService`] is the composition root of the engine: it owns the
//! registry, the delivery log and the scheduler, fans triggered events out
//! to subscribers, and wires registry removals to chain cancellation.

use crate::{
    delivery::{DeliveryStats, DeliveryStore, DeliveryUpdate, WebhookDelivery},
    events::{WebhookEventKind, WebhookPayload},
    registry::{RegistryEvent, WebhookRegistry},
    retry::{RetryPolicy, RetryScheduler},
    sender::DeliverySender,
    tester::{TestResult, WebhookTester},
    transport::{HttpTransport, ReqwestTransport},
    Result, WebhookError,
};
use formhook_core::{AppConfig, FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Webhook delivery service
pub struct WebhookService {
    registry: Arc<WebhookRegistry>,
    deliveries: Arc<DeliveryStore>,
    scheduler: Arc<RetryScheduler>,
    tester: WebhookTester,
}

impl WebhookService {
    /// Assemble the service around an existing registry and transport.
    ///
    /// Must be called inside a tokio runtime; a background task listens for
    /// registry removals.
    pub fn new(
        registry: Arc<WebhookRegistry>,
        transport: Arc<dyn HttpTransport>,
        config: &AppConfig,
    ) -> Self {
        let sender = Arc::new(DeliverySender::new(
            transport,
            config.delivery.clone(),
            &config.http.user_agent,
        ));
        let deliveries = Arc::new(DeliveryStore::new());
        let scheduler = Arc::new(RetryScheduler::new(
            sender.clone(),
            deliveries.clone(),
            RetryPolicy::from(&config.retry),
        ));

        spawn_removal_watcher(&registry, &scheduler);

        Self {
            registry,
            deliveries,
            scheduler,
            tester: WebhookTester::new(sender),
        }
    }

    /// Build the service from application configuration: key-value store,
    /// registry contents, and reqwest transport
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.storage.path {
            Some(path) => Arc::new(FileKeyValueStore::new(path)),
            None => Arc::new(InMemoryKeyValueStore::new()),
        };
        let registry = Arc::new(WebhookRegistry::load(store, &config.storage.webhooks_key).await?);
        let transport = Arc::new(ReqwestTransport::new(&config.http)?);

        Ok(Self::new(registry, transport, config))
    }

    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.registry
    }

    pub fn deliveries(&self) -> &Arc<DeliveryStore> {
        &self.deliveries
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    /// Notify every active subscriber of `event` on `form_id`.
    ///
    /// Returns the new `pending` delivery records as soon as their chains are
    /// started; attempt results land in the delivery log.
    pub fn trigger_webhook(
        &self,
        form_id: &str,
        event: WebhookEventKind,
        data: Value,
    ) -> Result<Vec<WebhookDelivery>> {
        self.trigger_webhook_with_metadata(form_id, event, data, None)
    }

    /// [`WebhookService::trigger_webhook`] with explicit envelope metadata
    pub fn trigger_webhook_with_metadata(
        &self,
        form_id: &str,
        event: WebhookEventKind,
        data: Value,
        metadata: Option<Value>,
    ) -> Result<Vec<WebhookDelivery>> {
        let subscribers = self.registry.find_active_subscribers(form_id, event);
        if subscribers.is_empty() {
            debug!(form_id = %form_id, event = %event, "No webhooks subscribed to event");
            return Ok(Vec::new());
        }

        info!(
            form_id = %form_id,
            event = %event,
            subscribers = subscribers.len(),
            "Triggering webhooks"
        );

        if self.scheduler.is_shutting_down() {
            return Err(WebhookError::Shutdown);
        }

        let mut deliveries = Vec::with_capacity(subscribers.len());
        for webhook in subscribers {
            let delivery = WebhookDelivery::new(&webhook.id, event, data.clone())
                .with_metadata(metadata.clone());
            if let Err(e) = self.deliveries.create(delivery.clone()) {
                error!(delivery_id = %delivery.id, error = %e, "Failed to record delivery");
                continue;
            }

            let payload = WebhookPayload::build(form_id, event, data.clone(), metadata.clone());
            match self.scheduler.spawn_chain(webhook, delivery.id.clone(), payload) {
                Ok(()) => deliveries.push(delivery),
                Err(e) => {
                    // Shutdown raced the fan-out; the record still reaches the caller
                    warn!(delivery_id = %delivery.id, error = %e, "Delivery not started");
                    let update = DeliveryUpdate::failed(e.to_string(), None, None);
                    let failed = self.deliveries.update(&delivery.id, update);
                    deliveries.push(failed.unwrap_or(delivery));
                }
            }
        }

        Ok(deliveries)
    }

    /// Operator-initiated retry: reset the delivery to `pending` with no
    /// attempts and run a fresh chain, whatever state it ended in
    pub fn retry_manual_delivery(&self, delivery_id: &str) -> Result<WebhookDelivery> {
        let delivery = self
            .deliveries
            .find(delivery_id)
            .ok_or_else(|| WebhookError::DeliveryNotFound(delivery_id.to_string()))?;
        let webhook = self
            .registry
            .get(&delivery.webhook_id)
            .ok_or_else(|| WebhookError::NotFound(delivery.webhook_id.clone()))?;

        let token = self.scheduler.claim(delivery_id, &webhook.id)?;
        let reset = match self.deliveries.reset_for_retry(delivery_id) {
            Ok(reset) => reset,
            Err(e) => {
                self.scheduler.release(delivery_id);
                return Err(e);
            }
        };

        info!(
            delivery_id = %delivery_id,
            webhook_id = %webhook.id,
            previous_status = %delivery.status,
            "Manually retrying webhook delivery"
        );

        let payload = WebhookPayload::build(
            &webhook.form_id,
            reset.event,
            reset.payload.clone(),
            reset.metadata.clone(),
        );
        self.scheduler.launch(token, webhook, delivery_id.to_string(), payload);

        Ok(reset)
    }

    /// Send a single test delivery to a registered webhook
    pub async fn test_webhook(&self, webhook_id: &str) -> Result<TestResult> {
        let webhook = self
            .registry
            .get(webhook_id)
            .ok_or_else(|| WebhookError::NotFound(webhook_id.to_string()))?;

        Ok(self.tester.test(&webhook).await)
    }

    /// Deliveries of a webhook, newest first
    pub fn deliveries_for_webhook(&self, webhook_id: &str) -> Vec<WebhookDelivery> {
        self.deliveries.find_by_webhook(webhook_id)
    }

    /// Delivery statistics of a webhook
    pub fn delivery_stats(&self, webhook_id: &str) -> DeliveryStats {
        self.deliveries.stats_for_webhook(webhook_id)
    }

    /// Wait for all running delivery chains to finish
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Cancel pending retries and wait for every chain to settle
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        info!("Webhook service stopped");
    }
}

fn spawn_removal_watcher(registry: &Arc<WebhookRegistry>, scheduler: &Arc<RetryScheduler>) {
    let mut changes = registry.subscribe();
    let scheduler = Arc::clone(scheduler);
    let shutdown = scheduler.shutdown_token();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(RegistryEvent::Removed(webhook_id)) => scheduler.cancel_webhook(&webhook_id),
                    Ok(RegistryEvent::Upserted(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Registry change watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Registry change watcher stopped");
    });
}
