//! Call tasks: one unit of outbound-call work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transition::TransitionMap;

/// A unit of outbound-call work linking a caller to an expert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub expert_id: Uuid,

    /// Bound caller while the task is in flight.
    pub caller_id: Option<Uuid>,

    pub status: TaskStatus,

    /// Higher = dialed sooner. Ties go to the older task.
    pub priority_score: i32,

    pub assigned_at: Option<DateTime<Utc>>,
    pub execution_window: ExecutionWindow,
    pub attempted_dial_count: i32,
    pub outcome: Option<CallOutcome>,

    /// Audit trail and origin markers (operator requeues, chase origin).
    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Soft business window in which a task may be worked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ExecutionWindow {
    /// Open when started (or unbounded) and not yet ended.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| start <= now) && self.end.is_none_or(|end| end > now)
    }
}

status_enum! {
    /// Lifecycle state of a task.
    pub enum TaskStatus {
        /// Waiting for a caller.
        Pending => "PENDING",
        /// Bound to a caller, not yet dialing.
        Assigned => "ASSIGNED",
        /// A call for this task is in progress.
        Dialing => "DIALING",
        Completed => "COMPLETED",
        Cancelled => "CANCELLED",
        /// Execution window lapsed.
        Expired => "EXPIRED",
        Restricted => "RESTRICTED",
    }
}

impl TaskStatus {
    /// Statuses counted as the caller's current work.
    pub const IN_FLIGHT: [TaskStatus; 2] = [TaskStatus::Assigned, TaskStatus::Dialing];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Cancelled
                | TaskStatus::Expired
                | TaskStatus::Restricted
        )
    }

    pub fn is_in_flight(self) -> bool {
        Self::IN_FLIGHT.contains(&self)
    }
}

/// Allowed task transitions.
pub const TASK_TRANSITIONS: TransitionMap<TaskStatus> = &[
    (
        TaskStatus::Pending,
        &[
            TaskStatus::Assigned,
            TaskStatus::Cancelled,
            TaskStatus::Expired,
        ],
    ),
    (
        TaskStatus::Assigned,
        &[
            TaskStatus::Dialing,
            TaskStatus::Pending,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::Expired,
        ],
    ),
    (
        TaskStatus::Dialing,
        &[
            TaskStatus::Pending,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
            TaskStatus::Restricted,
        ],
    ),
    (TaskStatus::Completed, &[]),
    (TaskStatus::Cancelled, &[]),
    (TaskStatus::Expired, &[]),
    (TaskStatus::Restricted, &[]),
];

status_enum! {
    /// What the caller reports after working a task.
    pub enum CallOutcome {
        /// Expert agreed; signup chase follows.
        InterestedSignupLinkSent => "INTERESTED_SIGNUP_LINK_SENT",
        /// Not now; the expert goes back into the pool.
        RetryableRejection => "RETRYABLE_REJECTION",
        /// Suppress the expert permanently.
        NeverContactAgain => "NEVER_CONTACT_AGAIN",
    }
}

/// Parameters for creating a pending task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: Uuid,
    pub expert_id: Uuid,
    pub priority_score: i32,
    pub execution_window: ExecutionWindow,
    pub attempted_dial_count: i32,
    pub metadata: serde_json::Value,
}

impl NewTask {
    pub fn new(project_id: Uuid, expert_id: Uuid) -> Self {
        Self {
            project_id,
            expert_id,
            priority_score: 0,
            execution_window: ExecutionWindow::default(),
            attempted_dial_count: 0,
            metadata: serde_json::json!({}),
        }
    }

    pub fn priority(mut self, priority_score: i32) -> Self {
        self.priority_score = priority_score;
        self
    }

    pub fn window(mut self, window: ExecutionWindow) -> Self {
        self.execution_window = window;
        self
    }

    pub fn attempted_dials(mut self, count: i32) -> Self {
        self.attempted_dial_count = count;
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filters for the operator task listing.
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    pub caller_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub expert_id: Option<Uuid>,
    /// Defaults to 50 when unset.
    pub limit: Option<i64>,
}
