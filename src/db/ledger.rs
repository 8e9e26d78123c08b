//! Idempotency ledger and webhook intake.
//!
//! Dedup is decided by the primary key on `processed_webhook_events`: two
//! concurrent inserts of one event id race, exactly one wins, and the loser
//! sees a unique violation that becomes `DuplicateWebhookEvent`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::{NewSystemEvent, SystemEvent};
use crate::model::{CallEvent, IdempotencyEntry, Intake, JobEnvelope, LedgerStatus, QueueName};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Hex SHA-256 of the payload's JSON encoding.
pub fn payload_hash<T: Serialize>(payload: &T) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Lock the ledger entry for `event_id`, registering it first if intake
/// was bypassed. Returns the status found before this call.
pub(crate) async fn claim_entry_on(
    conn: &mut PgConnection,
    event: &CallEvent,
    now: DateTime<Utc>,
) -> Result<LedgerStatus> {
    let status: Option<(String,)> = sqlx::query_as(
        "SELECT status FROM processed_webhook_events WHERE event_id = $1 FOR UPDATE",
    )
    .bind(&event.event_id)
    .fetch_optional(&mut *conn)
    .await?;

    match status {
        Some((status,)) => status.parse(),
        None => {
            let entry = insert_entry_on(conn, &event.event_id, &payload_hash(event)?, now).await?;
            Ok(entry.status)
        }
    }
}

async fn insert_entry_on(
    conn: &mut PgConnection,
    event_id: &str,
    hash: &str,
    now: DateTime<Utc>,
) -> Result<IdempotencyEntry> {
    let inserted = sqlx::query_as::<_, EntryRow>(
        "INSERT INTO processed_webhook_events (event_id, payload_hash, status, received_at)
         VALUES ($1, $2, 'accepted', $3)
         RETURNING event_id, payload_hash, status, received_at, processed_at",
    )
    .bind(event_id)
    .bind(hash)
    .bind(now)
    .fetch_one(conn)
    .await;

    match inserted {
        Ok(row) => row.try_into_entry(),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(Error::DuplicateWebhookEvent {
                event_id: event_id.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Stamp the ledger entry inside the caller's transaction.
pub(crate) async fn mark_processed_on(
    conn: &mut PgConnection,
    event_id: &str,
    status: LedgerStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE processed_webhook_events SET status = $1, processed_at = $2 WHERE event_id = $3",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(event_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Append a system event inside the caller's transaction.
pub(crate) async fn record_system_event_on(
    conn: &mut PgConnection,
    event: NewSystemEvent,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO system_events (category, entity_type, entity_id, correlation_id, message, payload, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(event.category.as_str())
    .bind(event.entity_type)
    .bind(&event.entity_id)
    .bind(&event.correlation_id)
    .bind(event.message)
    .bind(&event.payload)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

impl super::Db {
    /// Record an event id the first time it is seen.
    ///
    /// A second registration of the same id fails with
    /// `Error::DuplicateWebhookEvent`; callers treat that as an
    /// acknowledgment, not a failure.
    pub async fn register_if_new<T: Serialize>(
        &self,
        event_id: &str,
        payload: &T,
    ) -> Result<IdempotencyEntry> {
        let hash = payload_hash(payload)?;
        let mut conn = self.pool().acquire().await?;
        let result = insert_entry_on(&mut conn, event_id, &hash, self.now()).await;
        record_intake(match &result {
            Ok(_) => "accepted",
            Err(e) if e.is_duplicate() => "duplicate",
            Err(_) => "error",
        });
        result
    }

    /// Register a verified call event and queue it for processing, in one
    /// transaction. Duplicates come back as `Intake::Duplicate`.
    pub async fn accept_call_event(
        &self,
        event: &CallEvent,
        correlation_id: &str,
    ) -> Result<Intake> {
        let hash = payload_hash(event)?;
        let mut tx = self.pool().begin().await?;

        let entry = match insert_entry_on(&mut tx, &event.event_id, &hash, self.now()).await {
            Err(e) if e.is_duplicate() => {
                record_intake("duplicate");
                debug!(event_id = %event.event_id, "duplicate call event acknowledged");
                return Ok(Intake::Duplicate {
                    event_id: event.event_id.clone(),
                });
            }
            other => other?,
        };

        let job = JobEnvelope::new(correlation_id, event);
        let job_msg_id = crate::db::pgmq::send_job_on(&mut tx, QueueName::CallEvents, &job).await?;
        tx.commit().await?;

        record_intake("accepted");
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            correlation_id,
            job_msg_id,
            "call event accepted"
        );
        Ok(Intake::Accepted {
            entry: Box::new(entry),
            job_msg_id,
        })
    }

    /// Mark a ledger entry with its final status.
    pub async fn mark_processed(&self, event_id: &str, status: LedgerStatus) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        mark_processed_on(&mut conn, event_id, status, self.now()).await
    }

    /// Look up a ledger entry.
    pub async fn get_idempotency_entry(&self, event_id: &str) -> Result<Option<IdempotencyEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT event_id, payload_hash, status, received_at, processed_at
             FROM processed_webhook_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(EntryRow::try_into_entry).transpose()
    }

    /// Audit rows for one entity, oldest first.
    pub async fn list_system_events(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<SystemEvent>> {
        let rows: Vec<SystemEventRow> = sqlx::query_as(
            "SELECT id, category, entity_type, entity_id, correlation_id, message, payload, created_at
             FROM system_events
             WHERE entity_type = $1 AND entity_id = $2
             ORDER BY id ASC",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(SystemEventRow::try_into_event).collect()
    }
}

fn record_intake(result: &'static str) {
    metrics::webhook_events().add(1, &[KeyValue::new("result", result)]);
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EntryRow {
    event_id: String,
    payload_hash: String,
    status: String,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl EntryRow {
    fn try_into_entry(self) -> Result<IdempotencyEntry> {
        Ok(IdempotencyEntry {
            event_id: self.event_id,
            payload_hash: self.payload_hash,
            status: self.status.parse()?,
            received_at: self.received_at,
            processed_at: self.processed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SystemEventRow {
    id: i64,
    category: String,
    entity_type: String,
    entity_id: String,
    correlation_id: Option<String>,
    message: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl SystemEventRow {
    fn try_into_event(self) -> Result<SystemEvent> {
        Ok(SystemEvent {
            id: self.id,
            category: self.category.parse()?,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            correlation_id: self.correlation_id,
            message: self.message,
            payload: self.payload,
            created_at: self.created_at,
        })
    }
}
