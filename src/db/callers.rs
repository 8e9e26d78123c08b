//! Caller and expert records.
//!
//! Every caller status write goes through [`set_caller_status_on`], which
//! checks the transition table first.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    AllocationStatus, CALLER_TRANSITIONS, Caller, Expert, FraudStatus, NewCaller, NewExpert,
};
use crate::telemetry::spans::record_state_transition;
use crate::transition::assert_valid_transition;

const CALLER_COLUMNS: &str =
    "id, allocation_status, region_codes, language_codes, timezone, fraud_status, created_at";

const EXPERT_COLUMNS: &str = "id, status, country_code, timezone, language_codes";

/// Load a caller, optionally taking a row lock for the rest of the
/// transaction.
pub(crate) async fn fetch_caller_on(
    conn: &mut PgConnection,
    caller_id: Uuid,
    for_update: bool,
) -> Result<Option<Caller>> {
    let sql = format!(
        "SELECT {CALLER_COLUMNS} FROM callers WHERE id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row: Option<CallerRow> = sqlx::query_as(&sql)
        .bind(caller_id)
        .fetch_optional(conn)
        .await?;
    row.map(CallerRow::try_into_caller).transpose()
}

pub(crate) async fn fetch_expert_on(
    conn: &mut PgConnection,
    expert_id: Uuid,
) -> Result<Option<Expert>> {
    let sql = format!("SELECT {EXPERT_COLUMNS} FROM experts WHERE id = $1");
    let row: Option<ExpertRow> = sqlx::query_as(&sql)
        .bind(expert_id)
        .fetch_optional(conn)
        .await?;
    row.map(ExpertRow::try_into_expert).transpose()
}

/// Move a caller to `to`, optionally stamping a fraud status alongside.
///
/// Returns the status actually stored. A same-state request with no fraud
/// change writes nothing.
pub(crate) async fn set_caller_status_on(
    conn: &mut PgConnection,
    caller: &Caller,
    to: AllocationStatus,
    fraud_status: Option<FraudStatus>,
    now: DateTime<Utc>,
) -> Result<AllocationStatus> {
    assert_valid_transition("caller", CALLER_TRANSITIONS, caller.allocation_status, to)?;

    let fraud_unchanged = fraud_status.is_none_or(|f| f == caller.fraud_status);
    if caller.allocation_status == to && fraud_unchanged {
        return Ok(to);
    }

    sqlx::query(
        "UPDATE callers
         SET allocation_status = $1, fraud_status = COALESCE($2, fraud_status), updated_at = $3
         WHERE id = $4",
    )
    .bind(to.as_str())
    .bind(fraud_status.map(FraudStatus::as_str))
    .bind(now)
    .bind(caller.id)
    .execute(conn)
    .await?;

    if caller.allocation_status != to {
        record_state_transition("caller", caller.allocation_status.as_str(), to.as_str());
    }
    Ok(to)
}

impl super::Db {
    /// Onboard a caller. `created_at` is stamped from the engine clock, so
    /// warmup starts now.
    pub async fn create_caller(&self, new: NewCaller) -> Result<Caller> {
        let sql = format!(
            "INSERT INTO callers (id, allocation_status, region_codes, language_codes, timezone,
                                  fraud_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'CLEAR', $6, $6)
             RETURNING {CALLER_COLUMNS}"
        );
        let row: CallerRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(new.allocation_status.as_str())
            .bind(&new.region_codes)
            .bind(&new.language_codes)
            .bind(&new.timezone)
            .bind(self.now())
            .fetch_one(self.pool())
            .await?;
        row.try_into_caller()
    }

    /// Fetch a caller, failing with `CallerNotFound` when absent.
    pub async fn get_caller(&self, caller_id: Uuid) -> Result<Caller> {
        let mut conn = self.pool().acquire().await?;
        fetch_caller_on(&mut conn, caller_id, false)
            .await?
            .ok_or(Error::CallerNotFound(caller_id))
    }

    pub async fn create_expert(&self, new: NewExpert) -> Result<Expert> {
        let sql = format!(
            "INSERT INTO experts (id, status, country_code, timezone, language_codes, created_at, updated_at)
             VALUES ($1, 'ACTIVE', $2, $3, $4, $5, $5)
             RETURNING {EXPERT_COLUMNS}"
        );
        let row: ExpertRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.country_code)
            .bind(&new.timezone)
            .bind(&new.language_codes)
            .bind(self.now())
            .fetch_one(self.pool())
            .await?;
        row.try_into_expert()
    }

    pub async fn get_expert(&self, expert_id: Uuid) -> Result<Option<Expert>> {
        let mut conn = self.pool().acquire().await?;
        fetch_expert_on(&mut conn, expert_id).await
    }

    /// Callers the maintenance loop keeps recalculating and nudging.
    pub async fn active_caller_ids(&self) -> Result<Vec<Uuid>> {
        let statuses: Vec<&str> = AllocationStatus::ACTIVE_ISH
            .iter()
            .map(|s| s.as_str())
            .collect();
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM callers WHERE allocation_status = ANY($1) ORDER BY created_at",
        )
        .bind(&statuses)
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CallerRow {
    id: Uuid,
    allocation_status: String,
    region_codes: Vec<String>,
    language_codes: Vec<String>,
    timezone: Option<String>,
    fraud_status: String,
    created_at: DateTime<Utc>,
}

impl CallerRow {
    fn try_into_caller(self) -> Result<Caller> {
        Ok(Caller {
            id: self.id,
            allocation_status: self.allocation_status.parse()?,
            region_codes: self.region_codes,
            language_codes: self.language_codes,
            timezone: self.timezone,
            fraud_status: self.fraud_status.parse()?,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExpertRow {
    id: Uuid,
    status: String,
    country_code: String,
    timezone: Option<String>,
    language_codes: Vec<String>,
}

impl ExpertRow {
    fn try_into_expert(self) -> Result<Expert> {
        Ok(Expert {
            id: self.id,
            status: self.status.parse()?,
            country_code: self.country_code,
            timezone: self.timezone,
            language_codes: self.language_codes,
        })
    }
}
