//! Webhook delivery tracking
//!
//! Provides delivery status tracking with an enforced transition graph,
//! per-delivery serialized updates, and per-webhook statistics.

use crate::{events::WebhookEventKind, Result, WebhookError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, first attempt not finished yet
    Pending,
    /// Delivered successfully
    Delivered,
    /// Waiting for the next retry
    Retrying,
    /// Failed permanently
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }

    /// `delivered` and `failed` end a delivery chain
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Delivered)
                | (Pending, Retrying)
                | (Pending, Failed)
                | (Retrying, Retrying)
                | (Retrying, Delivered)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt chain for one (webhook, event occurrence) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    /// Delivery ID
    pub id: String,
    /// Owning webhook
    pub webhook_id: String,
    /// Event kind
    pub event: WebhookEventKind,
    /// Raw event data, not yet wrapped in the envelope
    pub payload: Value,
    /// Envelope metadata supplied by the trigger; the event default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Current status
    pub status: DeliveryStatus,
    /// Last observed HTTP status code
    pub http_status: Option<u16>,
    /// Last response body (truncated)
    pub response: Option<String>,
    /// Error of the last failed attempt; cleared once delivered
    pub error: Option<String>,
    /// HTTP attempts made so far
    pub attempt_count: u32,
    /// Next retry, only while retrying
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set on success
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Create a pending delivery with no attempts
    pub fn new(webhook_id: &str, event: WebhookEventKind, payload: Value) -> Self {
        Self {
            id: format!("whd_{}", Uuid::new_v4().simple()),
            webhook_id: webhook_id.to_string(),
            event,
            payload,
            metadata: None,
            status: DeliveryStatus::Pending,
            http_status: None,
            response: None,
            error: None,
            attempt_count: 0,
            next_retry_at: None,
            delivered_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if delivery succeeded
    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

/// Fields changed by one state-machine step; `None` leaves a field as is
#[derive(Debug, Clone, Default)]
pub struct DeliveryUpdate {
    pub status: Option<DeliveryStatus>,
    pub http_status: Option<u16>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl DeliveryUpdate {
    pub fn delivered(http_status: u16, response: String) -> Self {
        Self {
            status: Some(DeliveryStatus::Delivered),
            http_status: Some(http_status),
            response: Some(response),
            delivered_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn retrying(
        error: String,
        http_status: Option<u16>,
        response: Option<String>,
        next_retry_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(DeliveryStatus::Retrying),
            http_status,
            response,
            error: Some(error),
            next_retry_at: Some(next_retry_at),
            ..Default::default()
        }
    }

    pub fn failed(error: String, http_status: Option<u16>, response: Option<String>) -> Self {
        Self {
            status: Some(DeliveryStatus::Failed),
            http_status,
            response,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Delivery change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub delivery_id: String,
    pub webhook_id: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
}

/// Delivery statistics for one webhook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub total: u64,
    pub pending: u64,
    pub retrying: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Delivered over terminal deliveries (0.0 - 1.0)
    pub success_rate: f64,
    /// Average attempts per delivery
    pub avg_attempts: f64,
}

/// In-memory delivery log.
///
/// Each record sits behind its own lock, so updates to one delivery are
/// serialized while different deliveries update in parallel.
pub struct DeliveryStore {
    deliveries: DashMap<String, Arc<Mutex<WebhookDelivery>>>,
    by_webhook: DashMap<String, Vec<String>>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl Default for DeliveryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            deliveries: DashMap::new(),
            by_webhook: DashMap::new(),
            events,
        }
    }

    /// Append a new delivery record
    pub fn create(&self, delivery: WebhookDelivery) -> Result<()> {
        let id = delivery.id.clone();
        let webhook_id = delivery.webhook_id.clone();
        let event = Self::event_for(&delivery);

        match self.deliveries.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(WebhookError::DuplicateDelivery(id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(delivery)));
            }
        }

        self.by_webhook.entry(webhook_id).or_default().push(id);
        let _ = self.events.send(event);
        Ok(())
    }

    /// Merge changed fields into a delivery, enforcing the transition graph
    pub fn update(&self, id: &str, update: DeliveryUpdate) -> Result<WebhookDelivery> {
        let record = self.record(id)?;
        let mut delivery = record.lock();

        if let Some(next) = update.status {
            if !delivery.status.can_transition_to(next) {
                warn!(
                    delivery_id = %id,
                    from = %delivery.status,
                    to = %next,
                    "Rejected invalid delivery transition"
                );
                return Err(WebhookError::InvalidTransition {
                    id: id.to_string(),
                    from: delivery.status,
                    to: next,
                });
            }
            delivery.status = next;
        }

        if let Some(http_status) = update.http_status {
            delivery.http_status = Some(http_status);
        }
        if let Some(response) = update.response {
            delivery.response = Some(response);
        }
        if let Some(error) = update.error {
            delivery.error = Some(error);
        }
        if let Some(next_retry_at) = update.next_retry_at {
            delivery.next_retry_at = Some(next_retry_at);
        }
        if let Some(delivered_at) = update.delivered_at {
            delivery.delivered_at = Some(delivered_at);
        }

        if delivery.status != DeliveryStatus::Retrying {
            delivery.next_retry_at = None;
        }
        if delivery.status == DeliveryStatus::Delivered {
            // Errors of earlier attempts do not describe a delivered record
            delivery.error = None;
            if delivery.delivered_at.is_none() {
                delivery.delivered_at = Some(Utc::now());
            }
        }

        let snapshot = delivery.clone();
        drop(delivery);

        debug!(delivery_id = %id, status = %snapshot.status, "Updated delivery");
        let _ = self.events.send(Self::event_for(&snapshot));
        Ok(snapshot)
    }

    /// Count one more HTTP attempt and return the new attempt number
    pub fn increment_attempt(&self, id: &str) -> Result<u32> {
        let record = self.record(id)?;
        let mut delivery = record.lock();
        delivery.attempt_count += 1;
        Ok(delivery.attempt_count)
    }

    /// Put a delivery back to `pending` with no attempts.
    ///
    /// Used by operator-initiated retries; bypasses the terminal-state rule.
    pub fn reset_for_retry(&self, id: &str) -> Result<WebhookDelivery> {
        let record = self.record(id)?;
        let mut delivery = record.lock();

        delivery.status = DeliveryStatus::Pending;
        delivery.attempt_count = 0;
        delivery.http_status = None;
        delivery.response = None;
        delivery.error = None;
        delivery.next_retry_at = None;
        delivery.delivered_at = None;

        let snapshot = delivery.clone();
        drop(delivery);

        let _ = self.events.send(Self::event_for(&snapshot));
        Ok(snapshot)
    }

    /// Get delivery by ID
    pub fn find(&self, id: &str) -> Option<WebhookDelivery> {
        self.deliveries.get(id).map(|record| record.lock().clone())
    }

    /// Deliveries of one webhook, newest first
    pub fn find_by_webhook(&self, webhook_id: &str) -> Vec<WebhookDelivery> {
        let ids = self
            .by_webhook
            .get(webhook_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        ids.iter().rev().filter_map(|id| self.find(id)).collect()
    }

    /// Aggregate statistics for one webhook
    pub fn stats_for_webhook(&self, webhook_id: &str) -> DeliveryStats {
        let deliveries = self.find_by_webhook(webhook_id);
        let mut stats = DeliveryStats {
            total: deliveries.len() as u64,
            ..Default::default()
        };

        let mut attempts = 0u64;
        for delivery in &deliveries {
            attempts += delivery.attempt_count as u64;
            match delivery.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Retrying => stats.retrying += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Failed => stats.failed += 1,
            }
        }

        let completed = stats.delivered + stats.failed;
        if completed > 0 {
            stats.success_rate = stats.delivered as f64 / completed as f64;
        }
        if stats.total > 0 {
            stats.avg_attempts = attempts as f64 / stats.total as f64;
        }

        stats
    }

    /// Subscribe to delivery changes
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    fn record(&self, id: &str) -> Result<Arc<Mutex<WebhookDelivery>>> {
        self.deliveries
            .get(id)
            .map(|record| record.clone())
            .ok_or_else(|| WebhookError::DeliveryNotFound(id.to_string()))
    }

    fn event_for(delivery: &WebhookDelivery) -> DeliveryEvent {
        DeliveryEvent {
            delivery_id: delivery.id.clone(),
            webhook_id: delivery.webhook_id.clone(),
            status: delivery.status,
            attempt_count: delivery.attempt_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn delivery(webhook_id: &str) -> WebhookDelivery {
        WebhookDelivery::new(
            webhook_id,
            WebhookEventKind::SubmissionCreated,
            json!({ "submissionId": "sub-1" }),
        )
    }

    #[test]
    fn test_transition_graph() {
        use DeliveryStatus::*;

        assert!(Pending.can_transition_to(Delivered));
        assert!(Pending.can_transition_to(Retrying));
        assert!(Pending.can_transition_to(Failed));
        assert!(Retrying.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Delivered));
        assert!(Retrying.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Pending));
        assert!(!Retrying.can_transition_to(Pending));
        for terminal in [Delivered, Failed] {
            assert!(terminal.is_terminal());
            for next in [Pending, Delivered, Retrying, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_create_and_find() {
        let store = DeliveryStore::new();
        let d = delivery("wh_1");
        let id = d.id.clone();
        store.create(d.clone()).unwrap();

        assert_eq!(store.find(&id).unwrap(), d);
        assert!(matches!(
            store.create(d),
            Err(WebhookError::DuplicateDelivery(_))
        ));
        assert!(store.find("missing").is_none());
    }

    #[test]
    fn test_find_by_webhook_newest_first() {
        let store = DeliveryStore::new();
        let first = delivery("wh_1");
        let second = delivery("wh_1");
        store.create(first.clone()).unwrap();
        store.create(second.clone()).unwrap();
        store.create(delivery("wh_2")).unwrap();

        let found = store.find_by_webhook("wh_1");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, second.id);
        assert_eq!(found[1].id, first.id);
        assert!(store.find_by_webhook("wh_3").is_empty());
    }

    #[test]
    fn test_retrying_then_delivered_clears_retry_state() {
        let store = DeliveryStore::new();
        let d = delivery("wh_1");
        let id = d.id.clone();
        store.create(d).unwrap();

        let retry_at = Utc::now() + Duration::seconds(1);
        let retrying = store
            .update(
                &id,
                DeliveryUpdate::retrying("HTTP 500".into(), Some(500), None, retry_at),
            )
            .unwrap();
        assert_eq!(retrying.status, DeliveryStatus::Retrying);
        assert_eq!(retrying.next_retry_at, Some(retry_at));
        assert_eq!(retrying.http_status, Some(500));

        let delivered = store
            .update(&id, DeliveryUpdate::delivered(200, "ok".into()))
            .unwrap();
        assert_eq!(delivered.status, DeliveryStatus::Delivered);
        assert!(delivered.next_retry_at.is_none());
        assert!(delivered.delivered_at.is_some());
        assert_eq!(delivered.http_status, Some(200));
        assert_eq!(delivered.response.as_deref(), Some("ok"));
        assert!(delivered.error.is_none());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let store = DeliveryStore::new();
        let d = delivery("wh_1");
        let id = d.id.clone();
        store.create(d).unwrap();
        store
            .update(&id, DeliveryUpdate::failed("boom".into(), None, None))
            .unwrap();

        let result = store.update(&id, DeliveryUpdate::delivered(200, String::new()));
        assert!(matches!(
            result,
            Err(WebhookError::InvalidTransition {
                from: DeliveryStatus::Failed,
                to: DeliveryStatus::Delivered,
                ..
            })
        ));
        assert_eq!(store.find(&id).unwrap().status, DeliveryStatus::Failed);
    }

    #[test]
    fn test_update_unknown_delivery() {
        let store = DeliveryStore::new();
        assert!(matches!(
            store.update("nope", DeliveryUpdate::default()),
            Err(WebhookError::DeliveryNotFound(_))
        ));
        assert!(store.increment_attempt("nope").is_err());
    }

    #[test]
    fn test_increment_and_reset() {
        let store = DeliveryStore::new();
        let d = delivery("wh_1").with_metadata(Some(json!({ "source": "import" })));
        let id = d.id.clone();
        store.create(d).unwrap();

        assert_eq!(store.increment_attempt(&id).unwrap(), 1);
        assert_eq!(store.increment_attempt(&id).unwrap(), 2);
        store
            .update(&id, DeliveryUpdate::failed("HTTP 503".into(), Some(503), None))
            .unwrap();

        let reset = store.reset_for_retry(&id).unwrap();
        assert_eq!(reset.status, DeliveryStatus::Pending);
        assert_eq!(reset.attempt_count, 0);
        assert!(reset.error.is_none());
        assert!(reset.http_status.is_none());
        assert_eq!(reset.payload["submissionId"], "sub-1");
        assert_eq!(reset.metadata, Some(json!({ "source": "import" })));
    }

    #[test]
    fn test_stats_for_webhook() {
        let store = DeliveryStore::new();
        let ids: Vec<_> = (0..4)
            .map(|_| {
                let d = delivery("wh_1");
                let id = d.id.clone();
                store.create(d).unwrap();
                store.increment_attempt(&id).unwrap();
                id
            })
            .collect();

        store
            .update(&ids[0], DeliveryUpdate::delivered(200, String::new()))
            .unwrap();
        store
            .update(&ids[1], DeliveryUpdate::delivered(204, String::new()))
            .unwrap();
        store
            .update(&ids[2], DeliveryUpdate::failed("HTTP 410".into(), Some(410), None))
            .unwrap();

        let stats = store.stats_for_webhook("wh_1");
        assert_eq!(stats.total, 4);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 0.001);
        assert!((stats.avg_attempts - 1.0).abs() < 0.001);

        assert_eq!(store.stats_for_webhook("wh_none"), DeliveryStats::default());
    }

    #[tokio::test]
    async fn test_change_events() {
        let store = DeliveryStore::new();
        let mut events = store.subscribe();

        let d = delivery("wh_1");
        let id = d.id.clone();
        store.create(d).unwrap();
        store
            .update(&id, DeliveryUpdate::delivered(200, String::new()))
            .unwrap();

        assert_eq!(events.recv().await.unwrap().status, DeliveryStatus::Pending);
        let delivered = events.recv().await.unwrap();
        assert_eq!(delivered.status, DeliveryStatus::Delivered);
        assert_eq!(delivered.delivery_id, id);
    }

    #[test]
    fn test_concurrent_updates_to_distinct_deliveries() {
        let store = Arc::new(DeliveryStore::new());
        let ids: Vec<_> = (0..8)
            .map(|_| {
                let d = delivery("wh_1");
                let id = d.id.clone();
                store.create(d).unwrap();
                id
            })
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.increment_attempt(&id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for id in ids {
            assert_eq!(store.find(&id).unwrap().attempt_count, 100);
        }
    }
}
