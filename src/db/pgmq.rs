//! pgmq job transport via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive. `read_ct` on a message is the transport's attempt counter.

use crate::error::Result;
use crate::model::{JobEnvelope, QueueName};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde::Serialize;
use sqlx::PgConnection;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    /// Deliveries so far, this one included.
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

/// Send a job inside a caller-owned transaction. The message becomes
/// visible only if that transaction commits.
pub(crate) async fn send_job_on<T: Serialize>(
    conn: &mut PgConnection,
    queue: QueueName,
    job: &JobEnvelope<T>,
) -> Result<i64> {
    let payload = serde_json::to_value(job)?;
    let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
        .bind(queue.as_str())
        .bind(&payload)
        .bind(0i32)
        .fetch_one(conn)
        .await?;
    record_operation(queue, "send");
    Ok(row.0)
}

fn record_operation(queue: QueueName, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.as_str()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create every queue the engine uses (idempotent).
    pub async fn create_queues(&self) -> Result<()> {
        for queue in QueueName::ALL {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(queue.as_str())
                .execute(self.pool())
                .await?;
            record_operation(queue, "create");
        }
        Ok(())
    }

    /// Enqueue a job. Returns the message ID.
    pub async fn send_job<T: Serialize>(
        &self,
        queue: QueueName,
        job: &JobEnvelope<T>,
    ) -> Result<i64> {
        let mut conn = self.pool().acquire().await?;
        send_job_on(&mut conn, queue, job).await
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_job(&self, queue: QueueName, vt_seconds: i32) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue.as_str())
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        record_operation(queue, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_job(&self, queue: QueueName, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue.as_str())
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record_operation(queue, "archive");
        Ok(())
    }
}
