//! Output formatting utilities

use colored::Colorize;
use formhook_webhook::{DeliveryStats, DeliveryStatus, TestResult, WebhookConfig, WebhookDelivery};
use serde::Serialize;

/// Output format types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

/// Print a value as pretty JSON
pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", "ℹ".blue(), message);
}

/// Print a key-value pair
pub fn key_value(key: &str, value: &str) {
    println!("  {}: {}", key.bold(), value);
}

pub fn webhook(config: &WebhookConfig) {
    let state = if config.is_active {
        "active".green()
    } else {
        "inactive".dimmed()
    };
    println!("{} [{}]", config.id.bold(), state);
    key_value("form", &config.form_id);
    key_value("url", &config.url);

    let mut events: Vec<&str> = config.events.iter().map(|e| e.as_str()).collect();
    events.sort_unstable();
    key_value("events", &events.join(", "));
    key_value(
        "signed",
        if config.signing_secret().is_some() { "yes" } else { "no" },
    );
}

pub fn delivery(delivery: &WebhookDelivery) {
    let status = match delivery.status {
        DeliveryStatus::Delivered => delivery.status.as_str().green(),
        DeliveryStatus::Failed => delivery.status.as_str().red(),
        _ => delivery.status.as_str().yellow(),
    };
    println!("{} [{}]", delivery.id.bold(), status);
    key_value("webhook", &delivery.webhook_id);
    key_value("attempts", &delivery.attempt_count.to_string());
    if let Some(code) = delivery.http_status {
        key_value("http status", &code.to_string());
    }
    if let Some(error) = &delivery.error {
        key_value("error", error);
    }
}

pub fn stats(stats: &DeliveryStats) {
    key_value("total", &stats.total.to_string());
    key_value("delivered", &stats.delivered.to_string());
    key_value("failed", &stats.failed.to_string());
    key_value("success rate", &format!("{:.0}%", stats.success_rate * 100.0));
    key_value("avg attempts", &format!("{:.1}", stats.avg_attempts));
}

pub fn test_result(result: &TestResult) {
    if result.success {
        success("Test delivery succeeded");
    } else {
        error("Test delivery failed");
    }
    if let Some(code) = result.status_code {
        key_value("http status", &code.to_string());
    }
    if let Some(error) = &result.error {
        key_value("error", error);
    }
    if let Some(body) = result.response.as_deref().filter(|b| !b.is_empty()) {
        key_value("response", body);
    }
    key_value("duration", &format!("{}ms", result.duration_ms));
}
