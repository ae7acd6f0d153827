//! Webhook event kinds and the delivery envelope

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Event kinds a webhook can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventKind {
    // Submission events
    #[serde(rename = "submission.created")]
    SubmissionCreated,
    #[serde(rename = "submission.updated")]
    SubmissionUpdated,
    #[serde(rename = "submission.deleted")]
    SubmissionDeleted,

    // Form events
    #[serde(rename = "form.published")]
    FormPublished,

    // Analytics and reporting
    #[serde(rename = "analytics.milestone")]
    AnalyticsMilestone,
    #[serde(rename = "report.generated")]
    ReportGenerated,

    /// Synthetic kind used by test sends; never raised by the application
    #[serde(rename = "webhook.test")]
    WebhookTest,
}

impl WebhookEventKind {
    /// Kinds raised by the application and available for subscription
    pub const SUBSCRIBABLE: [WebhookEventKind; 6] = [
        Self::SubmissionCreated,
        Self::SubmissionUpdated,
        Self::SubmissionDeleted,
        Self::FormPublished,
        Self::AnalyticsMilestone,
        Self::ReportGenerated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmissionCreated => "submission.created",
            Self::SubmissionUpdated => "submission.updated",
            Self::SubmissionDeleted => "submission.deleted",
            Self::FormPublished => "form.published",
            Self::AnalyticsMilestone => "analytics.milestone",
            Self::ReportGenerated => "report.generated",
            Self::WebhookTest => "webhook.test",
        }
    }

    /// Get category for this event kind
    pub fn category(&self) -> &'static str {
        match self {
            Self::SubmissionCreated | Self::SubmissionUpdated | Self::SubmissionDeleted => {
                "submission"
            }
            Self::FormPublished => "form",
            Self::AnalyticsMilestone => "analytics",
            Self::ReportGenerated => "report",
            Self::WebhookTest => "webhook",
        }
    }
}

impl fmt::Display for WebhookEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::SUBSCRIBABLE
            .iter()
            .chain(std::iter::once(&Self::WebhookTest))
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event kind: {}", s))
    }
}

/// The JSON envelope POSTed to a webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Envelope ID, stable across retries of one delivery
    pub id: String,
    /// Event kind
    pub event: WebhookEventKind,
    /// When the envelope was built
    pub timestamp: DateTime<Utc>,
    /// Form the event belongs to
    pub form_id: String,
    /// Raw event data
    pub data: Value,
    /// Free-form metadata, e.g. `{"source": "submission"}`
    pub metadata: Value,
}

impl WebhookPayload {
    /// Build a fresh envelope.
    ///
    /// Without explicit metadata the envelope carries `{"source": <category>}`.
    pub fn build(
        form_id: &str,
        event: WebhookEventKind,
        data: Value,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event,
            timestamp: Utc::now(),
            form_id: form_id.to_string(),
            data,
            metadata: metadata.unwrap_or_else(|| json!({ "source": event.category() })),
        }
    }

    /// Serialize to the exact bytes that are signed and sent
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_string() {
        assert_eq!(WebhookEventKind::SubmissionCreated.as_str(), "submission.created");
        assert_eq!(WebhookEventKind::ReportGenerated.to_string(), "report.generated");
        assert_eq!(WebhookEventKind::WebhookTest.as_str(), "webhook.test");
    }

    #[test]
    fn test_event_category() {
        assert_eq!(WebhookEventKind::SubmissionDeleted.category(), "submission");
        assert_eq!(WebhookEventKind::FormPublished.category(), "form");
        assert_eq!(WebhookEventKind::AnalyticsMilestone.category(), "analytics");
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(
            "form.published".parse::<WebhookEventKind>().unwrap(),
            WebhookEventKind::FormPublished
        );
        assert!("form.deleted".parse::<WebhookEventKind>().is_err());
        assert!(!WebhookEventKind::SUBSCRIBABLE.contains(&WebhookEventKind::WebhookTest));
    }

    #[test]
    fn test_event_kind_serialization_matches_as_str() {
        for kind in WebhookEventKind::SUBSCRIBABLE {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.as_str().to_string()));
        }
    }

    #[test]
    fn test_build_envelope() {
        let payload = WebhookPayload::build(
            "form-1",
            WebhookEventKind::SubmissionCreated,
            json!({ "submissionId": "sub-1" }),
            None,
        );

        assert!(payload.id.starts_with("evt_"));
        assert_eq!(payload.form_id, "form-1");
        assert_eq!(payload.metadata, json!({ "source": "submission" }));

        let other = WebhookPayload::build(
            "form-1",
            WebhookEventKind::SubmissionCreated,
            Value::Null,
            Some(json!({ "source": "import" })),
        );
        assert_ne!(payload.id, other.id);
        assert_eq!(other.metadata["source"], "import");
    }

    #[test]
    fn test_envelope_wire_format() {
        let payload = WebhookPayload::build(
            "form-9",
            WebhookEventKind::FormPublished,
            json!({ "title": "Survey" }),
            None,
        );

        let json: Value = serde_json::from_slice(&payload.to_bytes().unwrap()).unwrap();
        assert_eq!(json["event"], "form.published");
        assert_eq!(json["formId"], "form-9");
        assert_eq!(json["data"]["title"], "Survey");
        assert!(json["timestamp"].is_string());
        assert!(json.get("form_id").is_none());
    }
}
