//! Serializable transactions with bounded retry.

use std::future::Future;
use std::time::Duration;

use sqlx::{PgConnection, Postgres, Transaction};
use tracing::debug;

use crate::error::{Error, Result};

pub const SERIALIZABLE_MAX_ATTEMPTS: u32 = 5;
pub const SERIALIZABLE_BACKOFF_MS: u64 = 10;

/// Run `op` until it succeeds, fails with something other than a
/// serialization conflict, or runs out of attempts.
///
/// Each call to `op` must open and commit its own transaction so a retry
/// starts from a fresh snapshot. Backoff doubles from
/// [`SERIALIZABLE_BACKOFF_MS`].
pub async fn retry_serializable<T, F, Fut>(operation: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=SERIALIZABLE_MAX_ATTEMPTS {
        match op().await {
            Err(e) if e.is_transaction_conflict() => {
                debug!(operation, attempt, "serialization conflict, retrying");
                if attempt < SERIALIZABLE_MAX_ATTEMPTS {
                    let backoff = SERIALIZABLE_BACKOFF_MS * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
            other => return other,
        }
    }

    crate::telemetry::metrics::serialization_retry_exhausted()
        .add(1, &[opentelemetry::KeyValue::new("operation", operation)]);
    Err(Error::SerializationRetryExhausted {
        attempts: SERIALIZABLE_MAX_ATTEMPTS,
    })
}

impl super::Db {
    /// Begin a transaction at SERIALIZABLE isolation.
    pub(crate) async fn begin_serializable(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        set_serializable(&mut tx).await?;
        Ok(tx)
    }
}

async fn set_serializable(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(conn)
        .await?;
    Ok(())
}
