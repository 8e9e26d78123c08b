//! Task allocation: assignment, outcomes, and operator overrides.
//!
//! Assignment runs at SERIALIZABLE isolation and retries on conflict. The
//! partial unique index `tasks_one_in_flight_per_caller` backs the
//! one-task-per-caller rule even if two assignments race past each other.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use sqlx::PgConnection;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::callers::{fetch_caller_on, set_caller_status_on};
use super::ledger::record_system_event_on;
use super::retry_serializable;
use crate::error::{Error, Result};
use crate::event::{EventCategory, NewSystemEvent};
use crate::model::{
    AllocationStatus, CallOutcome, ExecutionWindow, NewTask, TASK_TRANSITIONS, Task, TaskFilters,
    TaskStatus,
};
use crate::telemetry::metrics;
use crate::telemetry::spans::record_state_transition;
use crate::transition::assert_valid_transition;

pub(crate) const TASK_COLUMNS: &str = "id, project_id, expert_id, caller_id, status, priority_score, \
     assigned_at, window_starts_at, window_ends_at, attempted_dial_count, outcome, metadata, \
     created_at, updated_at";

const DEFAULT_LIST_LIMIT: i64 = 50;

/// What `submit_outcome` left behind.
#[derive(Debug, Clone)]
pub struct OutcomeReceipt {
    pub completed: Task,
    /// Fresh PENDING task for a retryable rejection.
    pub requeued: Option<Task>,
}

/// What `requeue_by_operator` left behind.
#[derive(Debug, Clone)]
pub struct RequeueReceipt {
    /// The in-flight task that was cancelled, if there was one.
    pub cancelled: Option<Task>,
    /// The task now waiting in the pool.
    pub pending: Task,
}

pub(crate) async fn insert_task_on(
    conn: &mut PgConnection,
    new: NewTask,
    now: DateTime<Utc>,
) -> Result<Task> {
    let sql = format!(
        "INSERT INTO tasks (id, project_id, expert_id, status, priority_score, window_starts_at,
                            window_ends_at, attempted_dial_count, metadata, created_at, updated_at)
         VALUES ($1, $2, $3, 'PENDING', $4, $5, $6, $7, $8, $9, $9)
         RETURNING {TASK_COLUMNS}"
    );
    let row: TaskRow = sqlx::query_as(&sql)
        .bind(Uuid::new_v4())
        .bind(new.project_id)
        .bind(new.expert_id)
        .bind(new.priority_score)
        .bind(new.execution_window.start)
        .bind(new.execution_window.end)
        .bind(new.attempted_dial_count)
        .bind(&new.metadata)
        .bind(now)
        .fetch_one(conn)
        .await?;
    row.try_into_task()
}

pub(crate) async fn fetch_task_on(
    conn: &mut PgConnection,
    task_id: Uuid,
    for_update: bool,
) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(task_id)
        .fetch_optional(conn)
        .await?;
    row.map(TaskRow::try_into_task).transpose()
}

/// Guarded status change.
///
/// Moving back to PENDING releases the caller binding and the assignment
/// stamp.
pub(crate) async fn transition_task_on(
    conn: &mut PgConnection,
    task: &Task,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<Task> {
    assert_valid_transition("task", TASK_TRANSITIONS, task.status, to)?;
    if task.status == to {
        return Ok(task.clone());
    }

    let sql = format!(
        "UPDATE tasks SET
             status = $1,
             caller_id = CASE WHEN $1 = 'PENDING' THEN NULL ELSE caller_id END,
             assigned_at = CASE WHEN $1 = 'PENDING' THEN NULL ELSE assigned_at END,
             updated_at = $2
         WHERE id = $3
         RETURNING {TASK_COLUMNS}"
    );
    let row: TaskRow = sqlx::query_as(&sql)
        .bind(to.as_str())
        .bind(now)
        .bind(task.id)
        .fetch_one(conn)
        .await?;

    record_state_transition("task", task.status.as_str(), to.as_str());
    row.try_into_task()
}

/// The caller's ASSIGNED or DIALING task, if any.
async fn in_flight_task_on(conn: &mut PgConnection, caller_id: Uuid) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE caller_id = $1 AND status IN ('ASSIGNED', 'DIALING')"
    );
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(caller_id)
        .fetch_optional(conn)
        .await?;
    row.map(TaskRow::try_into_task).transpose()
}

/// Append `entry` to the array at `metadata[key]`, creating either as
/// needed.
pub(crate) fn append_audit(metadata: &mut Value, key: &str, entry: Value) {
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Some(map) = metadata.as_object_mut() {
        let slot = map.entry(key).or_insert_with(|| json!([]));
        match slot.as_array_mut() {
            Some(items) => items.push(entry),
            None => *slot = json!([entry]),
        }
    }
}

fn record_poll(result: &'static str) {
    metrics::allocation_polls().add(1, &[KeyValue::new("result", result)]);
}

impl super::Db {
    /// Insert a PENDING task. This is the ingestion entry point.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let mut conn = self.pool().acquire().await?;
        insert_task_on(&mut conn, new, self.now()).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let mut conn = self.pool().acquire().await?;
        fetch_task_on(&mut conn, task_id, false).await
    }

    /// Return the caller's current task, assigning the best eligible
    /// PENDING task when they have none.
    ///
    /// Repeated polls return the same task until it leaves ASSIGNED or
    /// DIALING. Callers whose status does not allow new work get `None`
    /// without touching any task.
    #[instrument(skip(self), fields(caller_id = %caller_id))]
    pub async fn fetch_or_assign(&self, caller_id: Uuid) -> Result<Option<Task>> {
        let caller = self.get_caller(caller_id).await?;
        if !caller.allocation_status.can_receive_tasks() {
            debug!(status = %caller.allocation_status, "caller not eligible for tasks");
            record_poll("ineligible");
            return Ok(None);
        }

        let db = self;
        retry_serializable("fetch_or_assign", move || db.try_fetch_or_assign(caller_id)).await
    }

    async fn try_fetch_or_assign(&self, caller_id: Uuid) -> Result<Option<Task>> {
        let mut tx = self.begin_serializable().await?;
        let now = self.now();

        let caller = fetch_caller_on(&mut tx, caller_id, false)
            .await?
            .ok_or(Error::CallerNotFound(caller_id))?;
        if !caller.allocation_status.can_receive_tasks() {
            tx.commit().await?;
            record_poll("ineligible");
            return Ok(None);
        }

        if let Some(current) = in_flight_task_on(&mut tx, caller_id).await? {
            tx.commit().await?;
            record_poll("existing");
            return Ok(Some(current));
        }

        let candidate: Option<(Uuid,)> = sqlx::query_as(
            "SELECT t.id
             FROM tasks t
             JOIN experts e ON e.id = t.expert_id
             WHERE t.status = 'PENDING'
               AND e.status = 'ACTIVE'
               AND e.country_code = ANY($1)
               AND e.language_codes && $2
               AND ($3::text IS NULL OR e.timezone IS NULL OR e.timezone = $3)
               AND (t.window_starts_at IS NULL OR t.window_starts_at <= $4)
               AND (t.window_ends_at IS NULL OR t.window_ends_at > $4)
             ORDER BY t.priority_score DESC, t.created_at ASC
             LIMIT 1",
        )
        .bind(&caller.region_codes)
        .bind(&caller.language_codes)
        .bind(&caller.timezone)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((task_id,)) = candidate else {
            set_caller_status_on(
                &mut tx,
                &caller,
                AllocationStatus::IdleNoAvailableTasks,
                None,
                now,
            )
            .await?;
            tx.commit().await?;
            record_poll("none");
            debug!("no eligible pending task");
            return Ok(None);
        };

        assert_valid_transition(
            "task",
            TASK_TRANSITIONS,
            TaskStatus::Pending,
            TaskStatus::Assigned,
        )?;
        let window_end =
            now + chrono::Duration::minutes(self.enforcement().assignment_window_minutes);
        let sql = format!(
            "UPDATE tasks SET
                 status = 'ASSIGNED', caller_id = $1, assigned_at = $2,
                 window_starts_at = $2, window_ends_at = $3, updated_at = $2
             WHERE id = $4 AND status = 'PENDING'
             RETURNING {TASK_COLUMNS}"
        );
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(caller_id)
            .bind(now)
            .bind(window_end)
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;
        let task = row.try_into_task()?;
        tx.commit().await?;

        record_state_transition(
            "task",
            TaskStatus::Pending.as_str(),
            TaskStatus::Assigned.as_str(),
        );
        record_poll("assigned");
        info!(
            task_id = %task.id,
            expert_id = %task.expert_id,
            priority = task.priority_score,
            "task assigned"
        );
        Ok(Some(task))
    }

    /// Record the caller's outcome for a task they own and complete it.
    ///
    /// Resubmitting for a task that already carries an outcome is a no-op.
    #[instrument(skip(self), fields(caller_id = %caller_id, task_id = %task_id))]
    pub async fn submit_outcome(
        &self,
        caller_id: Uuid,
        task_id: Uuid,
        outcome: CallOutcome,
    ) -> Result<OutcomeReceipt> {
        let mut tx = self.pool().begin().await?;
        let now = self.now();

        let task = match fetch_task_on(&mut tx, task_id, true).await? {
            Some(task) if task.caller_id == Some(caller_id) => task,
            _ => return Err(Error::TaskNotFoundForCaller { caller_id, task_id }),
        };

        if task.status == TaskStatus::Completed && task.outcome.is_some() {
            tx.commit().await?;
            debug!(outcome = ?task.outcome, "outcome already recorded");
            return Ok(OutcomeReceipt {
                completed: task,
                requeued: None,
            });
        }

        let completed = transition_task_on(&mut tx, &task, TaskStatus::Completed, now).await?;
        let sql = format!(
            "UPDATE tasks SET outcome = $1, updated_at = $2 WHERE id = $3 RETURNING {TASK_COLUMNS}"
        );
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(outcome.as_str())
            .bind(now)
            .bind(completed.id)
            .fetch_one(&mut *tx)
            .await?;
        let completed = row.try_into_task()?;

        let requeued = match outcome {
            CallOutcome::NeverContactAgain => {
                sqlx::query(
                    "UPDATE experts SET status = 'SUPPRESSED', updated_at = $1 WHERE id = $2",
                )
                .bind(now)
                .bind(completed.expert_id)
                .execute(&mut *tx)
                .await?;
                info!(expert_id = %completed.expert_id, "expert suppressed");
                None
            }
            CallOutcome::RetryableRejection => {
                let new = NewTask::new(completed.project_id, completed.expert_id)
                    .priority(completed.priority_score)
                    .metadata(json!({
                        "origin": "retryable_rejection",
                        "source_task_id": completed.id,
                    }));
                Some(insert_task_on(&mut tx, new, now).await?)
            }
            CallOutcome::InterestedSignupLinkSent => None,
        };

        tx.commit().await?;
        info!(%outcome, requeued = requeued.is_some(), "outcome recorded");
        Ok(OutcomeReceipt {
            completed,
            requeued,
        })
    }

    /// Operator task listing, newest first.
    pub async fn list_for_operators(&self, filters: &TaskFilters) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::uuid IS NULL OR caller_id = $2)
               AND ($3::uuid IS NULL OR project_id = $3)
               AND ($4::uuid IS NULL OR expert_id = $4)
             ORDER BY created_at DESC
             LIMIT $5"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(filters.status.map(TaskStatus::as_str))
            .bind(filters.caller_id)
            .bind(filters.project_id)
            .bind(filters.expert_id)
            .bind(filters.limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// Put a task back in the pool on an operator's say-so.
    ///
    /// In-flight tasks are cancelled and replaced by a PENDING copy that
    /// keeps priority, dial history, and metadata. A PENDING task only
    /// gains the audit record. The previously bound caller is not told.
    #[instrument(skip(self, reason), fields(task_id = %task_id))]
    pub async fn requeue_by_operator(
        &self,
        task_id: Uuid,
        operator: &str,
        reason: &str,
    ) -> Result<RequeueReceipt> {
        let mut tx = self.pool().begin().await?;
        let now = self.now();

        let task = fetch_task_on(&mut tx, task_id, true)
            .await?
            .ok_or(Error::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            return Err(Error::InvalidRequeueState {
                task_id,
                status: task.status.to_string(),
            });
        }

        let audit = json!({
            "operator": operator,
            "reason": reason,
            "at": now,
            "previous_status": task.status,
            "previous_caller_id": task.caller_id,
        });
        let mut metadata = task.metadata.clone();
        append_audit(&mut metadata, "operator_requeues", audit.clone());

        let receipt = if task.status == TaskStatus::Pending {
            let sql = format!(
                "UPDATE tasks SET metadata = $1, updated_at = $2 WHERE id = $3 RETURNING {TASK_COLUMNS}"
            );
            let row: TaskRow = sqlx::query_as(&sql)
                .bind(&metadata)
                .bind(now)
                .bind(task.id)
                .fetch_one(&mut *tx)
                .await?;
            RequeueReceipt {
                cancelled: None,
                pending: row.try_into_task()?,
            }
        } else {
            let cancelled = transition_task_on(&mut tx, &task, TaskStatus::Cancelled, now).await?;
            if let Some(map) = metadata.as_object_mut() {
                map.insert("requeued_from".into(), json!(task.id));
            }
            let new = NewTask::new(task.project_id, task.expert_id)
                .priority(task.priority_score)
                .attempted_dials(task.attempted_dial_count)
                .metadata(metadata);
            let pending = insert_task_on(&mut tx, new, now).await?;
            RequeueReceipt {
                cancelled: Some(cancelled),
                pending,
            }
        };

        record_system_event_on(
            &mut tx,
            NewSystemEvent::new(
                EventCategory::Allocation,
                "task",
                task.id,
                "task_requeued_by_operator",
            )
            .payload(json!({
                "audit": audit,
                "pending_task_id": receipt.pending.id,
            })),
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            operator,
            pending_task_id = %receipt.pending.id,
            cancelled = receipt.cancelled.is_some(),
            "task requeued by operator"
        );
        Ok(receipt)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct TaskRow {
    id: Uuid,
    project_id: Uuid,
    expert_id: Uuid,
    caller_id: Option<Uuid>,
    status: String,
    priority_score: i32,
    assigned_at: Option<DateTime<Utc>>,
    window_starts_at: Option<DateTime<Utc>>,
    window_ends_at: Option<DateTime<Utc>>,
    attempted_dial_count: i32,
    outcome: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    pub(crate) fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            expert_id: self.expert_id,
            caller_id: self.caller_id,
            status: self.status.parse()?,
            priority_score: self.priority_score,
            assigned_at: self.assigned_at,
            execution_window: ExecutionWindow {
                start: self.window_starts_at,
                end: self.window_ends_at,
            },
            attempted_dial_count: self.attempted_dial_count,
            outcome: self.outcome.as_deref().map(str::parse).transpose()?,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_audit_creates_and_extends_array() {
        let mut metadata = json!({"origin": "ingest"});
        append_audit(&mut metadata, "operator_requeues", json!({"operator": "ana"}));
        append_audit(&mut metadata, "operator_requeues", json!({"operator": "ben"}));

        assert_eq!(metadata["origin"], "ingest");
        let items = metadata["operator_requeues"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["operator"], "ben");
    }

    #[test]
    fn append_audit_replaces_non_object_metadata() {
        let mut metadata = Value::Null;
        append_audit(&mut metadata, "operator_requeues", json!(1));
        assert_eq!(metadata, json!({"operator_requeues": [1]}));
    }
}
