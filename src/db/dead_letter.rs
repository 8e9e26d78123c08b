//! Dead-letter storage.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::engine::dead_letter::DeadLetterSink;
use crate::error::Result;
use crate::model::{DeadLetterEntry, NewDeadLetter};

const DEAD_LETTER_COLUMNS: &str = "id, queue_name, job_id, payload, error_message, stack_trace, \
     correlation_id, failed_at, archived_at";

impl super::Db {
    pub async fn create_dead_letter(&self, new: NewDeadLetter) -> Result<DeadLetterEntry> {
        let sql = format!(
            "INSERT INTO dead_letter_jobs (queue_name, job_id, payload, error_message, stack_trace,
                                           correlation_id, failed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {DEAD_LETTER_COLUMNS}"
        );
        let row: DeadLetterRow = sqlx::query_as(&sql)
            .bind(&new.queue_name)
            .bind(&new.job_id)
            .bind(&new.payload)
            .bind(&new.error_message)
            .bind(&new.stack_trace)
            .bind(&new.correlation_id)
            .bind(new.failed_at)
            .fetch_one(self.pool())
            .await?;
        Ok(row.into_entry())
    }

    /// Soft-archive dead letters that failed before `cutoff`. Returns how
    /// many were archived.
    pub async fn archive_dead_letters_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE dead_letter_jobs SET archived_at = $1
             WHERE archived_at IS NULL AND failed_at < $2",
        )
        .bind(self.now())
        .bind(cutoff)
        .execute(self.pool())
        .await?;
        let archived = result.rows_affected();
        if archived > 0 {
            info!(archived, %cutoff, "dead letters archived");
        }
        Ok(archived)
    }

    /// Unarchived dead letters, most recent failure first.
    pub async fn list_active_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs
             WHERE archived_at IS NULL
             ORDER BY failed_at DESC
             LIMIT $1"
        );
        let rows: Vec<DeadLetterRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(DeadLetterRow::into_entry).collect())
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for super::Db {
    async fn persist(&self, entry: NewDeadLetter) -> Result<DeadLetterEntry> {
        self.create_dead_letter(entry).await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: i64,
    queue_name: String,
    job_id: String,
    payload: serde_json::Value,
    error_message: String,
    stack_trace: Option<String>,
    correlation_id: Option<String>,
    failed_at: DateTime<Utc>,
    archived_at: Option<DateTime<Utc>>,
}

impl DeadLetterRow {
    fn into_entry(self) -> DeadLetterEntry {
        DeadLetterEntry {
            id: self.id,
            queue_name: self.queue_name,
            job_id: self.job_id,
            payload: self.payload,
            error_message: self.error_message,
            stack_trace: self.stack_trace,
            correlation_id: self.correlation_id,
            failed_at: self.failed_at,
            archived_at: self.archived_at,
        }
    }
}
