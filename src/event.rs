//! System events: the engine's durable audit trail.
//!
//! Orphaned webhooks, fraud enforcement, operator overrides, and expiry
//! requeues each leave one row. Consumers read them for dashboards and
//! forensic review; nothing in the engine reads them back for decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub category: EventCategory,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: Option<String>,
    pub message: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Webhook,
    Fraud,
    Allocation,
    Maintenance,
}

impl EventCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::Webhook => "webhook",
            EventCategory::Fraud => "fraud",
            EventCategory::Allocation => "allocation",
            EventCategory::Maintenance => "maintenance",
        }
    }
}

impl std::str::FromStr for EventCategory {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "webhook" => Ok(EventCategory::Webhook),
            "fraud" => Ok(EventCategory::Fraud),
            "allocation" => Ok(EventCategory::Allocation),
            "maintenance" => Ok(EventCategory::Maintenance),
            other => Err(crate::error::Error::Other(format!(
                "unknown event category: {other}"
            ))),
        }
    }
}

/// Builder for an event about to be recorded.
#[derive(Debug, Clone)]
pub struct NewSystemEvent {
    pub(crate) category: EventCategory,
    pub(crate) entity_type: &'static str,
    pub(crate) entity_id: String,
    pub(crate) correlation_id: Option<String>,
    pub(crate) message: &'static str,
    pub(crate) payload: serde_json::Value,
}

impl NewSystemEvent {
    pub fn new(
        category: EventCategory,
        entity_type: &'static str,
        entity_id: impl ToString,
        message: &'static str,
    ) -> Self {
        Self {
            category,
            entity_type,
            entity_id: entity_id.to_string(),
            correlation_id: None,
            message,
            payload: serde_json::json!({}),
        }
    }

    pub fn correlation(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(str::to_string);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
