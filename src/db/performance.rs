//! Rolling caller performance and derived allocation status.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::callers::{fetch_caller_on, set_caller_status_on};
use crate::error::Result;
use crate::model::{PerformanceSnapshot, RollingWindow};
use crate::policy::{StatusInputs, derive_status, low_rate_minutes, warmup_active};
use crate::telemetry::metrics;

const SNAPSHOT_COLUMNS: &str = "id, caller_id, captured_at, rolling_60min_dials, \
     rolling_60min_connections, rolling_60min_valid_connections, short_calls_last_hour, \
     low_rate_minutes, warmup_active, derived_allocation_status";

/// Prior snapshots consulted when measuring a low-rate streak. Warmup
/// snapshots never count toward a streak.
const STREAK_HISTORY_LIMIT: i64 = 120;

impl super::Db {
    /// Aggregate the caller's last hour of calls, append a snapshot, and
    /// move the caller to the derived status.
    ///
    /// Returns `None` for an unknown caller. Fraud statuses are left as
    /// they are; the snapshot still records the numbers.
    #[instrument(skip(self), fields(caller_id = %caller_id))]
    pub async fn recalculate_for_caller(
        &self,
        caller_id: Uuid,
    ) -> Result<Option<PerformanceSnapshot>> {
        let mut tx = self.pool().begin().await?;
        let now = self.now();
        let policy = *self.enforcement();

        let Some(caller) = fetch_caller_on(&mut tx, caller_id, true).await? else {
            debug!("caller not found; nothing to recalculate");
            return Ok(None);
        };

        let since = now - chrono::Duration::hours(1);
        let (dials, connections, valid_connections, short_calls): (i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT
                     COUNT(*),
                     COUNT(*) FILTER (WHERE answered_at IS NOT NULL),
                     COUNT(*) FILTER (WHERE validated),
                     COUNT(*) FILTER (WHERE ended_at IS NOT NULL AND duration_seconds < $3)
                 FROM call_records
                 WHERE caller_id = $1 AND started_at >= $2",
            )
            .bind(caller_id)
            .bind(since)
            .bind(policy.min_call_duration_seconds)
            .fetch_one(&mut *tx)
            .await?;
        let window = RollingWindow {
            dials: saturating_i32(dials),
            connections: saturating_i32(connections),
            valid_connections: saturating_i32(valid_connections),
            short_calls: saturating_i32(short_calls),
        };

        let history: Vec<(DateTime<Utc>, i32)> = sqlx::query_as(
            "SELECT captured_at, rolling_60min_dials FROM performance_snapshots
             WHERE caller_id = $1 AND NOT warmup_active
             ORDER BY captured_at DESC
             LIMIT $2",
        )
        .bind(caller_id)
        .bind(STREAK_HISTORY_LIMIT)
        .fetch_all(&mut *tx)
        .await?;

        let low_rate = low_rate_minutes(now, window.dials, &history, policy.dials_per_hour_target);
        let warmup = warmup_active(now, caller.created_at, &policy);
        let derived = derive_status(
            StatusInputs {
                current: caller.allocation_status,
                rolling_60min_dials: window.dials,
                low_rate_minutes: low_rate,
                warmup_active: warmup,
            },
            &policy,
        );

        let sql = format!(
            "INSERT INTO performance_snapshots (caller_id, captured_at, rolling_60min_dials,
                 rolling_60min_connections, rolling_60min_valid_connections, short_calls_last_hour,
                 low_rate_minutes, warmup_active, derived_allocation_status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING {SNAPSHOT_COLUMNS}"
        );
        let row: SnapshotRow = sqlx::query_as(&sql)
            .bind(caller_id)
            .bind(now)
            .bind(window.dials)
            .bind(window.connections)
            .bind(window.valid_connections)
            .bind(window.short_calls)
            .bind(low_rate)
            .bind(warmup)
            .bind(derived.as_str())
            .fetch_one(&mut *tx)
            .await?;

        set_caller_status_on(&mut tx, &caller, derived, None, now).await?;
        tx.commit().await?;

        metrics::performance_recalculations()
            .add(1, &[KeyValue::new("status", derived.as_str())]);
        info!(
            dials = window.dials,
            low_rate_minutes = low_rate,
            warmup,
            status = %derived,
            "performance recalculated"
        );
        row.try_into_snapshot().map(Some)
    }

    /// Snapshots for a caller, newest first.
    pub async fn list_snapshots(
        &self,
        caller_id: Uuid,
        limit: i64,
    ) -> Result<Vec<PerformanceSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM performance_snapshots
             WHERE caller_id = $1 ORDER BY captured_at DESC LIMIT $2"
        );
        let rows: Vec<SnapshotRow> = sqlx::query_as(&sql)
            .bind(caller_id)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(SnapshotRow::try_into_snapshot).collect()
    }
}

fn saturating_i32(n: i64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: i64,
    caller_id: Uuid,
    captured_at: DateTime<Utc>,
    rolling_60min_dials: i32,
    rolling_60min_connections: i32,
    rolling_60min_valid_connections: i32,
    short_calls_last_hour: i32,
    low_rate_minutes: i32,
    warmup_active: bool,
    derived_allocation_status: String,
}

impl SnapshotRow {
    fn try_into_snapshot(self) -> Result<PerformanceSnapshot> {
        Ok(PerformanceSnapshot {
            id: self.id,
            caller_id: self.caller_id,
            captured_at: self.captured_at,
            rolling_60min_dials: self.rolling_60min_dials,
            rolling_60min_connections: self.rolling_60min_connections,
            rolling_60min_valid_connections: self.rolling_60min_valid_connections,
            short_calls_last_hour: self.short_calls_last_hour,
            low_rate_minutes: self.low_rate_minutes,
            warmup_active: self.warmup_active,
            derived_allocation_status: self.derived_allocation_status.parse()?,
        })
    }
}
