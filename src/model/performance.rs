//! Caller performance snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AllocationStatus;

/// Append-only point-in-time view of a caller's last rolling hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub id: i64,
    pub caller_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub rolling_60min_dials: i32,
    pub rolling_60min_connections: i32,
    pub rolling_60min_valid_connections: i32,
    pub short_calls_last_hour: i32,
    pub low_rate_minutes: i32,
    pub warmup_active: bool,
    pub derived_allocation_status: AllocationStatus,
}

/// Rolling-hour aggregates over a caller's call records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingWindow {
    pub dials: i32,
    pub connections: i32,
    pub valid_connections: i32,
    pub short_calls: i32,
}
