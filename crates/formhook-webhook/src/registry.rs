//! Webhook configuration registry
//!
//! Owns the set of [`WebhookConfig`] records, answers subscriber lookups for
//! the trigger path, and mirrors every mutation into the key-value store.

use crate::{
    events::WebhookEventKind, retry::RetryPolicy, signature::generate_webhook_secret, Result,
    WebhookError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use formhook_core::KeyValueStore;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One registered webhook subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Webhook ID
    pub id: String,
    /// Owning form
    pub form_id: String,
    /// Delivery target
    pub url: String,
    /// Subscribed event kinds; an empty set never matches
    #[serde(default)]
    pub events: HashSet<WebhookEventKind>,
    /// Shared signing key; unsigned deliveries when absent
    #[serde(default)]
    pub secret: Option<String>,
    /// Static headers added to every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Whether the webhook receives deliveries
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Retry policy; the engine default applies when absent
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl WebhookConfig {
    /// Create a new webhook with a freshly generated secret
    pub fn new(form_id: &str, url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("wh_{}", Uuid::new_v4().simple()),
            form_id: form_id.to_string(),
            url: url.to_string(),
            events: HashSet::new(),
            secret: Some(generate_webhook_secret()),
            headers: HashMap::new(),
            is_active: true,
            retry_policy: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = WebhookEventKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn with_secret(mut self, secret: Option<&str>) -> Self {
        self.secret = secret.map(str::to_string);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    /// Check if this webhook should receive `event`
    pub fn subscribes_to(&self, event: WebhookEventKind) -> bool {
        self.is_active && self.events.contains(&event)
    }

    /// Signing secret, treating an empty string as unset
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Validate URL and retry policy
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.url)
            .map_err(|e| WebhookError::InvalidUrl(format!("{}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookError::InvalidUrl(format!(
                "{}: unsupported scheme {}",
                self.url,
                url.scheme()
            )));
        }
        if self.id.is_empty() || self.form_id.is_empty() {
            return Err(WebhookError::InvalidConfig(
                "webhook id and form id are required".to_string(),
            ));
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Upserted(String),
    Removed(String),
}

/// Webhook configuration registry backed by a key-value store
pub struct WebhookRegistry {
    configs: DashMap<String, WebhookConfig>,
    store: Arc<dyn KeyValueStore>,
    key: String,
    events: broadcast::Sender<RegistryEvent>,
    // Serializes mutations: snapshot, store write, then map update
    write_lock: Mutex<()>,
}

impl WebhookRegistry {
    /// Create an empty registry
    pub fn new(store: Arc<dyn KeyValueStore>, key: &str) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            configs: DashMap::new(),
            store,
            key: key.to_string(),
            events,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a registry populated from the key-value store
    pub async fn load(store: Arc<dyn KeyValueStore>, key: &str) -> Result<Self> {
        let registry = Self::new(store, key);

        if let Some(value) = registry.store.get(key).await? {
            let configs: Vec<WebhookConfig> = serde_json::from_value(value)?;
            for config in configs {
                registry.configs.insert(config.id.clone(), config);
            }
        }

        info!(count = registry.configs.len(), key = %key, "Loaded webhook configurations");
        Ok(registry)
    }

    /// Insert or replace a webhook by ID.
    ///
    /// The store is written first; on a store error the registry is left
    /// unchanged and no change is broadcast.
    pub async fn upsert(&self, mut config: WebhookConfig) -> Result<WebhookConfig> {
        config.validate()?;

        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.configs.get(&config.id) {
            config.created_at = existing.created_at;
            config.updated_at = Utc::now();
        }

        info!(webhook_id = %config.id, url = %config.url, "Registering webhook");
        let mut snapshot = self.list();
        snapshot.retain(|c| c.id != config.id);
        snapshot.push(config.clone());
        sort_configs(&mut snapshot);
        self.persist(&snapshot).await?;

        self.configs.insert(config.id.clone(), config.clone());
        let _ = self.events.send(RegistryEvent::Upserted(config.id.clone()));
        Ok(config)
    }

    /// Remove a webhook; removing an unknown ID is a no-op.
    ///
    /// Like [`WebhookRegistry::upsert`], a failed store write keeps the
    /// webhook registered.
    pub async fn remove(&self, id: &str) -> Result<Option<WebhookConfig>> {
        let _guard = self.write_lock.lock().await;

        if !self.configs.contains_key(id) {
            debug!(webhook_id = %id, "Remove of unknown webhook ignored");
            return Ok(None);
        }

        info!(webhook_id = %id, "Removing webhook");
        let mut snapshot = self.list();
        snapshot.retain(|c| c.id != id);
        self.persist(&snapshot).await?;

        let removed = self.configs.remove(id).map(|(_, config)| config);
        let _ = self.events.send(RegistryEvent::Removed(id.to_string()));
        Ok(removed)
    }

    /// Active webhooks of `form_id` subscribed to `event`, in no particular order
    pub fn find_active_subscribers(
        &self,
        form_id: &str,
        event: WebhookEventKind,
    ) -> Vec<WebhookConfig> {
        self.configs
            .iter()
            .filter(|c| c.form_id == form_id && c.subscribes_to(event))
            .map(|c| c.clone())
            .collect()
    }

    /// Get a webhook by ID
    pub fn get(&self, id: &str) -> Option<WebhookConfig> {
        self.configs.get(id).map(|c| c.clone())
    }

    /// List all webhooks
    pub fn list(&self) -> Vec<WebhookConfig> {
        let mut configs: Vec<_> = self.configs.iter().map(|c| c.clone()).collect();
        sort_configs(&mut configs);
        configs
    }

    /// List webhooks of one form
    pub fn list_for_form(&self, form_id: &str) -> Vec<WebhookConfig> {
        let mut configs = self.list();
        configs.retain(|c| c.form_id == form_id);
        configs
    }

    /// Subscribe to registry changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    async fn persist(&self, snapshot: &[WebhookConfig]) -> Result<()> {
        let value = serde_json::to_value(snapshot)?;
        if let Err(e) = self.store.put(&self.key, value).await {
            warn!(key = %self.key, error = %e, "Failed to persist webhook configurations");
            return Err(e.into());
        }
        debug!(key = %self.key, count = snapshot.len(), "Persisted webhook configurations");
        Ok(())
    }
}

fn sort_configs(configs: &mut [WebhookConfig]) {
    configs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
