//! Queries behind the maintenance cycle.
//!
//! Each step claims its rows with `FOR UPDATE SKIP LOCKED` (or a single
//! UPDATE) so two scheduler processes running at once do not double-act.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use super::ledger::record_system_event_on;
use super::pgmq::send_job_on;
use super::tasks::{TASK_COLUMNS, TaskRow, insert_task_on, transition_task_on};
use crate::error::Result;
use crate::event::{EventCategory, NewSystemEvent};
use crate::model::{
    JobEnvelope, NewTask, QueueName, SYSTEM_CORRELATION_ID, ScreeningFollowUp, TaskStatus,
};

/// Metadata origin marking a signup chase task.
pub const SIGNUP_CHASE_ORIGIN: &str = "signup_chase";

impl super::Db {
    /// Enqueue one follow-up per (project, expert) whose screening has sat
    /// untouched since `stalled_before` and has not been nudged since then.
    /// Stamps `last_follow_up_at` in the same transaction as the sends.
    pub async fn enqueue_screening_follow_ups(
        &self,
        stalled_before: DateTime<Utc>,
    ) -> Result<usize> {
        let mut tx = self.pool().begin().await?;
        let now = self.now();

        let stalled: Vec<(Uuid, Uuid)> = sqlx::query_as(
            "UPDATE screening_responses SET last_follow_up_at = $1
             WHERE id IN (
                 SELECT id FROM screening_responses
                 WHERE status IN ('PENDING', 'IN_PROGRESS')
                   AND updated_at < $2
                   AND (last_follow_up_at IS NULL OR last_follow_up_at < $2)
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING project_id, expert_id",
        )
        .bind(now)
        .bind(stalled_before)
        .fetch_all(&mut *tx)
        .await?;

        let pairs: HashSet<(Uuid, Uuid)> = stalled.into_iter().collect();
        for (project_id, expert_id) in &pairs {
            let job = JobEnvelope::new(
                SYSTEM_CORRELATION_ID,
                ScreeningFollowUp {
                    project_id: *project_id,
                    expert_id: *expert_id,
                },
            );
            send_job_on(&mut tx, QueueName::ScreeningFollowup, &job).await?;
        }
        tx.commit().await?;

        if !pairs.is_empty() {
            info!(count = pairs.len(), "screening follow-ups enqueued");
        }
        Ok(pairs.len())
    }

    /// Create chase tasks for experts who took the signup link but have
    /// gone quiet. Returns the number created.
    ///
    /// At most one chase per (expert, project) per cycle, and no more than
    /// `daily_limit` chase tasks per expert per UTC day.
    pub async fn spawn_signup_chases(
        &self,
        quiet_since: DateTime<Utc>,
        daily_limit: i64,
    ) -> Result<usize> {
        let mut tx = self.pool().begin().await?;
        let now = self.now();
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(now);

        let sql = format!(
            "SELECT {} FROM tasks t
             JOIN experts e ON e.id = t.expert_id
             WHERE t.status = 'COMPLETED'
               AND t.outcome = 'INTERESTED_SIGNUP_LINK_SENT'
               AND t.updated_at < $1
               AND e.status = 'ACTIVE'
               AND NOT EXISTS (
                   SELECT 1 FROM tasks o
                   WHERE o.expert_id = t.expert_id
                     AND o.project_id = t.project_id
                     AND o.status IN ('PENDING', 'ASSIGNED', 'DIALING')
               )
             ORDER BY t.updated_at ASC
             FOR UPDATE OF t SKIP LOCKED",
            prefixed_task_columns("t")
        );
        let candidates: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(quiet_since)
            .fetch_all(&mut *tx)
            .await?;

        let mut chased_today: HashMap<Uuid, i64> = HashMap::new();
        let mut seen: HashSet<(Uuid, Uuid)> = HashSet::new();
        let mut created = 0;

        for row in candidates {
            let source = row.try_into_task()?;
            if !seen.insert((source.expert_id, source.project_id)) {
                continue;
            }

            let count = match chased_today.get(&source.expert_id) {
                Some(count) => *count,
                None => {
                    let (count,): (i64,) = sqlx::query_as(
                        "SELECT COUNT(*) FROM tasks
                         WHERE expert_id = $1
                           AND metadata->>'origin' = $2
                           AND created_at >= $3",
                    )
                    .bind(source.expert_id)
                    .bind(SIGNUP_CHASE_ORIGIN)
                    .bind(day_start)
                    .fetch_one(&mut *tx)
                    .await?;
                    count
                }
            };
            if count >= daily_limit {
                debug!(expert_id = %source.expert_id, count, "daily chase limit reached");
                chased_today.insert(source.expert_id, count);
                continue;
            }

            let chase = NewTask::new(source.project_id, source.expert_id)
                .priority(source.priority_score)
                .metadata(json!({
                    "origin": SIGNUP_CHASE_ORIGIN,
                    "source_task_id": source.id,
                }));
            insert_task_on(&mut tx, chase, now).await?;

            sqlx::query(
                "UPDATE tasks
                 SET metadata = metadata || jsonb_build_object('chase_spawned_at', $1::timestamptz),
                     updated_at = $1
                 WHERE id = $2",
            )
            .bind(now)
            .bind(source.id)
            .execute(&mut *tx)
            .await?;

            chased_today.insert(source.expert_id, count + 1);
            created += 1;
        }
        tx.commit().await?;

        if created > 0 {
            info!(created, "signup chase tasks created");
        }
        Ok(created)
    }

    /// Expire ASSIGNED tasks whose execution window has closed and put a
    /// fresh PENDING copy back in the pool. Returns the number expired.
    pub async fn expire_lapsed_assignments(&self) -> Result<usize> {
        let mut tx = self.pool().begin().await?;
        let now = self.now();

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'ASSIGNED' AND window_ends_at IS NOT NULL AND window_ends_at <= $1
             ORDER BY window_ends_at ASC
             FOR UPDATE SKIP LOCKED"
        );
        let lapsed: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(&mut *tx)
            .await?;

        let mut expired = 0;
        for row in lapsed {
            let task = row.try_into_task()?;
            transition_task_on(&mut tx, &task, TaskStatus::Expired, now).await?;

            let mut metadata = task.metadata.clone();
            if let Some(map) = metadata.as_object_mut() {
                map.insert("requeued_from".into(), json!(task.id));
                map.insert("origin".into(), json!("assignment_expired"));
            }
            let fresh = insert_task_on(
                &mut tx,
                NewTask::new(task.project_id, task.expert_id)
                    .priority(task.priority_score)
                    .attempted_dials(task.attempted_dial_count)
                    .metadata(metadata),
                now,
            )
            .await?;

            record_system_event_on(
                &mut tx,
                NewSystemEvent::new(
                    EventCategory::Maintenance,
                    "task",
                    task.id,
                    "task_assignment_expired",
                )
                .payload(json!({
                    "caller_id": task.caller_id,
                    "pending_task_id": fresh.id,
                })),
                now,
            )
            .await?;
            expired += 1;
        }
        tx.commit().await?;

        if expired > 0 {
            info!(expired, "lapsed assignments expired and requeued");
        }
        Ok(expired)
    }
}

fn prefixed_task_columns(alias: &str) -> String {
    TASK_COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
