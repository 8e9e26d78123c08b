//! Database connection pool, migrations, and health check.
//!
//! The pool is shared by every engine operation and by the pgmq job
//! transport, so queue sends can join the same transaction as the state
//! change that caused them.

pub mod callers;
pub mod calls;
pub mod dead_letter;
pub mod ledger;
pub mod maintenance;
pub mod performance;
pub mod pgmq;
pub mod tasks;
mod tx;

pub use tx::{SERIALIZABLE_BACKOFF_MS, SERIALIZABLE_MAX_ATTEMPTS, retry_serializable};

use crate::clock::{self, SharedClock};
use crate::config::Enforcement;
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool, the clock, and the
/// enforcement thresholds every operation reads.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
    clock: SharedClock,
    enforcement: Enforcement,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool with the system clock and default thresholds.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: clock::system(),
            enforcement: Enforcement::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_enforcement(mut self, enforcement: Enforcement) -> Self {
        self.enforcement = enforcement;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn enforcement(&self) -> &Enforcement {
        &self.enforcement
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
