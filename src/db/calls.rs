//! Call lifecycle event processing.
//!
//! One transaction per event: the call record upsert, the task and caller
//! changes, any fraud audit row, and the ledger stamp all commit together
//! or not at all. The ledger row is locked first, so a redelivery of an
//! event that already committed is a no-op.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::callers::{fetch_caller_on, fetch_expert_on, set_caller_status_on};
use super::ledger::{claim_entry_on, mark_processed_on, record_system_event_on};
use super::tasks::{fetch_task_on, transition_task_on};
use crate::error::{Error, Result};
use crate::event::{EventCategory, NewSystemEvent};
use crate::model::{
    AllocationStatus, CallEvent, CallEventType, CallMetadata, CallRecord, FraudVerdict,
    LedgerStatus, ProcessOutcome, Task, TaskStatus,
};
use crate::policy::{FraudInputs, evaluate_fraud, fraud_target};
use crate::telemetry::metrics;

const CALL_COLUMNS: &str = "call_id, task_id, caller_id, expert_id, project_id, started_at, \
     answered_at, ended_at, duration_seconds, validated, fraud_flag, termination_reason, sip_code, \
     recording_url, created_at, updated_at";

/// Insert or merge the call record. Later events fill in timing without
/// erasing what earlier events recorded.
async fn upsert_call_record_on(
    conn: &mut PgConnection,
    event: &CallEvent,
    meta: &CallMetadata,
    now: DateTime<Utc>,
) -> Result<CallRecord> {
    let ended_at = match event.event_type {
        CallEventType::Ended | CallEventType::Failed => event.timing.ended_at.or(Some(now)),
        _ => event.timing.ended_at,
    };
    let recording_url = event
        .recording
        .as_ref()
        .and_then(|r| r.recording_url.clone());

    let sql = format!(
        "INSERT INTO call_records (call_id, task_id, caller_id, expert_id, project_id, started_at,
                                   answered_at, ended_at, duration_seconds, termination_reason,
                                   sip_code, recording_url, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, COALESCE($6, $13), $7, $8, $9, $10, $11, $12, $13, $13)
         ON CONFLICT (call_id) DO UPDATE SET
             started_at = COALESCE($6, call_records.started_at),
             answered_at = COALESCE($7, call_records.answered_at),
             ended_at = COALESCE($8, call_records.ended_at),
             duration_seconds = GREATEST($9, call_records.duration_seconds),
             termination_reason = CASE WHEN $10 = '' THEN call_records.termination_reason ELSE $10 END,
             sip_code = COALESCE($11, call_records.sip_code),
             recording_url = COALESCE($12, call_records.recording_url),
             updated_at = $13
         RETURNING {CALL_COLUMNS}"
    );
    let row: CallRow = sqlx::query_as(&sql)
        .bind(&event.call_id)
        .bind(meta.task_id)
        .bind(meta.caller_id)
        .bind(meta.expert_id)
        .bind(meta.project_id)
        .bind(event.timing.initiated_at)
        .bind(event.timing.answered_at)
        .bind(ended_at)
        .bind(event.timing.duration_seconds)
        .bind(&event.termination.reason)
        .bind(event.termination.sip_code)
        .bind(recording_url)
        .bind(now)
        .fetch_one(conn)
        .await?;
    Ok(row.into_record())
}

/// Short or flagged ended calls by this caller created since `since`.
async fn count_recent_flagged_on(
    conn: &mut PgConnection,
    caller_id: Uuid,
    since: DateTime<Utc>,
    min_duration: i32,
) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM call_records
         WHERE caller_id = $1
           AND created_at >= $2
           AND ended_at IS NOT NULL
           AND (fraud_flag OR duration_seconds < $3)",
    )
    .bind(caller_id)
    .bind(since)
    .bind(min_duration)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

impl super::Db {
    /// Apply one provider call event.
    ///
    /// Events without task linkage are recorded as orphans and otherwise
    /// ignored. Events for a task that is terminal, or no longer bound to
    /// the event's caller, still update the call record but leave the task
    /// and caller alone. An event whose ledger entry is already final
    /// returns `AlreadyProcessed` without touching anything.
    #[instrument(
        skip(self, event),
        fields(event_id = %event.event_id, event_type = %event.event_type, call_id = %event.call_id)
    )]
    pub async fn process_event(
        &self,
        event: &CallEvent,
        correlation_id: Option<&str>,
    ) -> Result<ProcessOutcome> {
        let mut tx = self.pool().begin().await?;
        let now = self.now();

        let ledger_status = claim_entry_on(&mut tx, event, now).await?;
        if ledger_status != LedgerStatus::Accepted {
            tx.rollback().await?;
            info!(%ledger_status, "call event already processed; skipping");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let Some(meta) = event.metadata else {
            record_system_event_on(
                &mut tx,
                NewSystemEvent::new(
                    EventCategory::Webhook,
                    "call",
                    &event.call_id,
                    "orphan_call_event_missing_metadata",
                )
                .correlation(correlation_id)
                .payload(serde_json::to_value(event)?),
                now,
            )
            .await?;
            mark_processed_on(&mut tx, &event.event_id, LedgerStatus::Orphaned, now).await?;
            tx.commit().await?;
            warn!("call event has no task metadata; recorded as orphan");
            return Ok(ProcessOutcome::Orphaned);
        };

        let record = upsert_call_record_on(&mut tx, event, &meta, now).await?;

        let verdict = match fetch_task_on(&mut tx, meta.task_id, true).await? {
            None => {
                warn!(task_id = %meta.task_id, "call event references unknown task");
                FraudVerdict::NotEvaluated
            }
            Some(task) if task.status.is_terminal() => {
                info!(
                    task_id = %task.id,
                    status = %task.status,
                    "task already terminal; skipping task mutation"
                );
                FraudVerdict::NotEvaluated
            }
            Some(task) if task.caller_id != Some(meta.caller_id) => {
                info!(
                    task_id = %task.id,
                    event_caller_id = %meta.caller_id,
                    bound_caller_id = ?task.caller_id,
                    "task no longer bound to this caller; skipping task mutation"
                );
                FraudVerdict::NotEvaluated
            }
            Some(task) => {
                self.apply_to_task(&mut tx, event, &meta, &record, task, correlation_id, now)
                    .await?
            }
        };

        mark_processed_on(&mut tx, &event.event_id, LedgerStatus::Processed, now).await?;
        tx.commit().await?;

        info!(?verdict, "call event processed");
        Ok(ProcessOutcome::Applied(verdict))
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_to_task(
        &self,
        conn: &mut PgConnection,
        event: &CallEvent,
        meta: &CallMetadata,
        record: &CallRecord,
        task: Task,
        correlation_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FraudVerdict> {
        match event.event_type {
            CallEventType::Started => {
                let task = transition_task_on(conn, &task, TaskStatus::Dialing, now).await?;
                sqlx::query(
                    "UPDATE tasks SET attempted_dial_count = attempted_dial_count + 1 WHERE id = $1",
                )
                .bind(task.id)
                .execute(conn)
                .await?;
                Ok(FraudVerdict::NotEvaluated)
            }
            CallEventType::Answered => {
                transition_task_on(conn, &task, TaskStatus::Dialing, now).await?;
                Ok(FraudVerdict::NotEvaluated)
            }
            CallEventType::Failed => {
                transition_task_on(conn, &task, TaskStatus::Pending, now).await?;
                Ok(FraudVerdict::NotEvaluated)
            }
            CallEventType::Ended => {
                self.apply_ended(conn, meta, record, task, correlation_id, now).await
            }
            CallEventType::Ringing | CallEventType::RecordingReady => {
                Ok(FraudVerdict::NotEvaluated)
            }
        }
    }

    async fn apply_ended(
        &self,
        conn: &mut PgConnection,
        meta: &CallMetadata,
        record: &CallRecord,
        task: Task,
        correlation_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FraudVerdict> {
        let policy = *self.enforcement();
        let caller = fetch_caller_on(conn, meta.caller_id, true)
            .await?
            .ok_or(Error::CallerNotFound(meta.caller_id))?;
        let expert = fetch_expert_on(conn, meta.expert_id).await?;
        let expert_timezone = expert.as_ref().and_then(|e| e.timezone.as_deref());

        let inputs = FraudInputs {
            duration_seconds: record.duration_seconds,
            caller_timezone: caller.timezone.as_deref(),
            expert_timezone,
            recent_flagged_calls: 0,
        };
        let first_pass = evaluate_fraud(inputs, &policy);

        sqlx::query("UPDATE call_records SET validated = $1, fraud_flag = $2 WHERE call_id = $3")
            .bind(!first_pass.is_short)
            .bind(first_pass.is_fraud)
            .bind(&record.call_id)
            .execute(&mut *conn)
            .await?;

        if !first_pass.is_fraud {
            transition_task_on(conn, &task, TaskStatus::Completed, now).await?;
            return Ok(FraudVerdict::Clean);
        }

        let since = now - chrono::Duration::minutes(policy.fraud_window_minutes);
        let recent = count_recent_flagged_on(
            conn,
            caller.id,
            since,
            policy.min_call_duration_seconds,
        )
        .await?;
        let assessment = evaluate_fraud(
            FraudInputs {
                recent_flagged_calls: recent,
                ..inputs
            },
            &policy,
        );

        transition_task_on(conn, &task, TaskStatus::Pending, now).await?;

        let (target, fraud_status) =
            fraud_target(caller.allocation_status, assessment.should_escalate);
        set_caller_status_on(conn, &caller, target, Some(fraud_status), now).await?;

        let (verdict, enforcement) = match target {
            AllocationStatus::Suspended => (FraudVerdict::Suspended, "suspended"),
            _ => (FraudVerdict::Restricted, "restricted"),
        };
        metrics::fraud_enforcements().add(1, &[KeyValue::new("action", enforcement)]);

        record_system_event_on(
            conn,
            NewSystemEvent::new(
                EventCategory::Fraud,
                "caller",
                caller.id,
                "short_call_detected_restriction_applied",
            )
            .correlation(correlation_id)
            .payload(json!({
                "call_id": record.call_id,
                "duration_seconds": record.duration_seconds,
                "timezone_mismatch": assessment.timezone_mismatch,
                "recent_short_calls": recent,
                "enforcement": enforcement,
            })),
            now,
        )
        .await?;

        warn!(
            caller_id = %caller.id,
            duration_seconds = record.duration_seconds,
            timezone_mismatch = assessment.timezone_mismatch,
            recent_short_calls = recent,
            enforcement,
            "fraud enforcement applied"
        );
        Ok(verdict)
    }

    pub async fn get_call_record(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM call_records WHERE call_id = $1");
        let row: Option<CallRow> = sqlx::query_as(&sql)
            .bind(call_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(CallRow::into_record))
    }

    pub async fn count_call_records(&self, call_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM call_records WHERE call_id = $1")
                .bind(call_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CallRow {
    call_id: String,
    task_id: Uuid,
    caller_id: Uuid,
    expert_id: Uuid,
    project_id: Uuid,
    started_at: Option<DateTime<Utc>>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: i32,
    validated: bool,
    fraud_flag: bool,
    termination_reason: String,
    sip_code: Option<i32>,
    recording_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CallRow {
    fn into_record(self) -> CallRecord {
        CallRecord {
            call_id: self.call_id,
            task_id: self.task_id,
            caller_id: self.caller_id,
            expert_id: self.expert_id,
            project_id: self.project_id,
            started_at: self.started_at,
            answered_at: self.answered_at,
            ended_at: self.ended_at,
            duration_seconds: self.duration_seconds,
            validated: self.validated,
            fraud_flag: self.fraud_flag,
            termination_reason: self.termination_reason,
            sip_code: self.sip_code,
            recording_url: self.recording_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
