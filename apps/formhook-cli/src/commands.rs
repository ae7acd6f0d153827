//! Subcommand implementations

use anyhow::{bail, Context, Result};
use formhook_webhook::{WebhookConfig, WebhookEventKind, WebhookService};
use serde_json::{json, Value};
use tracing::info;

use crate::output::{self, OutputFormat};

/// Parse an event name that applications may subscribe to
pub fn parse_event(name: &str) -> Result<WebhookEventKind> {
    let kind = name.parse::<WebhookEventKind>().map_err(anyhow::Error::msg)?;
    if !WebhookEventKind::SUBSCRIBABLE.contains(&kind) {
        bail!("Event '{}' cannot be subscribed to or triggered", name);
    }
    Ok(kind)
}

/// Parse a `Name=value` header argument
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("Invalid header '{}', expected Name=value", raw),
    }
}

pub fn list(service: &WebhookService, form_id: Option<&str>, format: OutputFormat) -> Result<()> {
    let webhooks = match form_id {
        Some(form_id) => service.registry().list_for_form(form_id),
        None => service.registry().list(),
    };

    if format == OutputFormat::Json {
        return output::json(&webhooks);
    }

    if webhooks.is_empty() {
        output::info("No webhooks registered");
    }
    for webhook in &webhooks {
        output::webhook(webhook);
    }
    Ok(())
}

pub struct Registration {
    pub form_id: String,
    pub url: String,
    pub events: Vec<String>,
    pub secret: Option<String>,
    pub unsigned: bool,
    pub headers: Vec<String>,
}

pub async fn register(
    service: &WebhookService,
    registration: Registration,
    format: OutputFormat,
) -> Result<()> {
    let events = registration
        .events
        .iter()
        .map(|name| parse_event(name))
        .collect::<Result<Vec<_>>>()?;

    let mut config =
        WebhookConfig::new(&registration.form_id, &registration.url).with_events(events);
    if registration.unsigned {
        config = config.with_secret(None);
    } else if let Some(secret) = registration.secret.as_deref() {
        config = config.with_secret(Some(secret));
    }
    for raw in &registration.headers {
        let (name, value) = parse_header(raw)?;
        config = config.with_header(&name, &value);
    }

    let saved = service
        .registry()
        .upsert(config)
        .await
        .context("Failed to register webhook")?;
    info!(webhook_id = %saved.id, form_id = %saved.form_id, "Webhook registered");

    if format == OutputFormat::Json {
        return output::json(&saved);
    }

    output::success(&format!("Registered webhook {}", saved.id));
    output::webhook(&saved);
    if let Some(secret) = saved.signing_secret() {
        output::key_value("secret", secret);
    }
    Ok(())
}

pub async fn remove(service: &WebhookService, id: &str) -> Result<()> {
    match service.registry().remove(id).await? {
        Some(_) => output::success(&format!("Removed webhook {}", id)),
        None => output::info(&format!("Webhook {} was not registered", id)),
    }
    Ok(())
}

pub async fn test(service: &WebhookService, id: &str, format: OutputFormat) -> Result<()> {
    let result = service.test_webhook(id).await?;

    if format == OutputFormat::Json {
        output::json(&result)?;
    } else {
        output::test_result(&result);
    }

    if !result.success {
        bail!("Test delivery to {} failed", id);
    }
    Ok(())
}

pub async fn trigger(
    service: &WebhookService,
    form_id: &str,
    event: &str,
    data: &str,
    format: OutputFormat,
) -> Result<()> {
    let event = parse_event(event)?;
    let data: Value = serde_json::from_str(data).context("Invalid --data JSON")?;

    let created = service.trigger_webhook(form_id, event, data)?;
    if created.is_empty() {
        output::info("No active webhooks subscribed to this event");
        return Ok(());
    }

    info!(deliveries = created.len(), "Waiting for deliveries to settle");
    service.wait_idle().await;

    let deliveries: Vec<_> = created
        .iter()
        .filter_map(|d| service.deliveries().find(&d.id))
        .collect();

    if format == OutputFormat::Json {
        let report: Vec<Value> = deliveries
            .iter()
            .map(|d| {
                json!({
                    "delivery": d,
                    "stats": service.delivery_stats(&d.webhook_id),
                })
            })
            .collect();
        return output::json(&report);
    }

    for delivery in &deliveries {
        output::delivery(delivery);
        output::stats(&service.delivery_stats(&delivery.webhook_id));
    }
    Ok(())
}
