//! Dead-lettered jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A job that exhausted its retry budget, kept for triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub queue_name: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub correlation_id: Option<String>,
    pub failed_at: DateTime<Utc>,
    /// Soft retirement after the retention window.
    pub archived_at: Option<DateTime<Utc>>,
}

/// Parameters for persisting a dead letter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeadLetter {
    pub queue_name: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub correlation_id: Option<String>,
    pub failed_at: DateTime<Utc>,
}
