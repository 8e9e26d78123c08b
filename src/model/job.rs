//! Background job envelopes and queue definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queues the engine produces to or consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    CallEvents,
    CallAllocation,
    Performance,
    ScreeningFollowup,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::CallEvents,
        QueueName::CallAllocation,
        QueueName::Performance,
        QueueName::ScreeningFollowup,
    ];

    /// pgmq queue name. pgmq names become table suffixes, so underscores.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::CallEvents => "call_events",
            QueueName::CallAllocation => "call_allocation",
            QueueName::Performance => "performance",
            QueueName::ScreeningFollowup => "screening_followup",
        }
    }

    /// Deliveries allowed before a job is dead-lettered.
    pub fn configured_attempts(self) -> u32 {
        match self {
            QueueName::CallEvents => 5,
            QueueName::CallAllocation => 3,
            QueueName::Performance => 3,
            QueueName::ScreeningFollowup => 5,
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every job body. The correlation id travels with the data rather than in
/// ambient context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope<T> {
    pub correlation_id: String,
    pub data: T,
}

impl<T> JobEnvelope<T> {
    pub fn new(correlation_id: impl Into<String>, data: T) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            data,
        }
    }
}

/// Correlation id used for jobs the engine originates itself.
pub const SYSTEM_CORRELATION_ID: &str = "system";

/// Ask the allocation engine for a caller's current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationNudge {
    pub caller_id: Uuid,
}

/// Recompute a caller's rolling performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceRecompute {
    pub caller_id: Uuid,
}

/// Remind an expert about unfinished screening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreeningFollowUp {
    pub project_id: Uuid,
    pub expert_id: Uuid,
}

/// Delivery-level facts the transport reports when a job fails.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub queue_name: String,
    pub job_id: Option<String>,
    pub attempts_made: u32,
    pub configured_attempts: u32,
    pub error_message: String,
    pub stack_trace: Option<String>,
}

impl JobFailure {
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.configured_attempts
    }
}
