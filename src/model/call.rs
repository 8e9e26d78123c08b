//! Call records and normalized provider events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row per external call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub task_id: Uuid,
    pub caller_id: Uuid,
    pub expert_id: Uuid,
    pub project_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i32,
    /// Lasted at least the minimum valid duration.
    pub validated: bool,
    pub fraud_flag: bool,
    pub termination_reason: String,
    pub sip_code: Option<i32>,
    pub recording_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A provider event after signature checks and parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub event_id: String,
    pub event_type: CallEventType,
    pub call_id: String,
    /// Absent when the provider could not link the call to a task.
    pub metadata: Option<CallMetadata>,
    pub timing: CallTiming,
    pub termination: Termination,
    pub recording: Option<Recording>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventType {
    Started,
    Ringing,
    Answered,
    Ended,
    Failed,
    RecordingReady,
}

impl std::fmt::Display for CallEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallEventType::Started => "started",
            CallEventType::Ringing => "ringing",
            CallEventType::Answered => "answered",
            CallEventType::Ended => "ended",
            CallEventType::Failed => "failed",
            CallEventType::RecordingReady => "recording_ready",
        };
        write!(f, "{s}")
    }
}

/// Task linkage stamped on the call when it was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    pub project_id: Uuid,
    pub expert_id: Uuid,
    pub task_id: Uuid,
    pub caller_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallTiming {
    pub initiated_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Termination {
    pub reason: String,
    pub sip_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub recording_id: Option<String>,
    pub recording_url: Option<String>,
}

/// What `process_event` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Applied to call, task, and caller records.
    Applied(FraudVerdict),
    /// No task linkage; logged as a diagnostic and ignored.
    Orphaned,
    /// The ledger already holds a final status for this event id.
    AlreadyProcessed,
}

/// Fraud evaluation result for an `ended` event. `NotEvaluated` for every
/// other event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FraudVerdict {
    #[default]
    NotEvaluated,
    Clean,
    Restricted,
    Suspended,
}
