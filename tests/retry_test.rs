//! Serializable retry loop and conflict classification, without Postgres.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dialdesk::db::{SERIALIZABLE_MAX_ATTEMPTS, retry_serializable};
use dialdesk::error::Error;
use sqlx::error::{DatabaseError, ErrorKind};

/// Stand-in for a Postgres error carrying a SQLSTATE.
#[derive(Debug)]
struct PgFailure {
    code: &'static str,
    constraint: Option<&'static str>,
}

impl fmt::Display for PgFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sqlstate {}", self.code)
    }
}

impl std::error::Error for PgFailure {}

impl DatabaseError for PgFailure {
    fn message(&self) -> &str {
        "simulated database failure"
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self.code))
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn constraint(&self) -> Option<&str> {
        self.constraint
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

fn pg_error(code: &'static str, constraint: Option<&'static str>) -> Error {
    Error::Database(sqlx::Error::Database(Box::new(PgFailure { code, constraint })))
}

#[test]
fn concurrent_writer_errors_count_as_conflicts() {
    assert!(pg_error("40001", None).is_transaction_conflict());
    assert!(pg_error("40P01", None).is_transaction_conflict());
    assert!(pg_error("23505", Some("tasks_one_in_flight_per_caller")).is_transaction_conflict());
    assert!(!pg_error("23505", Some("experts_pkey")).is_transaction_conflict());
    assert!(!pg_error("42P01", None).is_transaction_conflict());
}

#[tokio::test(start_paused = true)]
async fn persistent_conflict_exhausts_the_retry_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let result: Result<(), Error> = retry_serializable("always_conflicts", move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(pg_error("40001", None))
        }
    })
    .await;

    match result {
        Err(Error::SerializationRetryExhausted { attempts }) => assert_eq!(attempts, 5),
        other => panic!("expected retry exhaustion, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), SERIALIZABLE_MAX_ATTEMPTS);
}

#[tokio::test(start_paused = true)]
async fn conflict_then_success_returns_the_value() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let value = retry_serializable("conflicts_twice", move || {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(pg_error("40001", None))
            } else {
                Ok(7)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn other_errors_are_returned_without_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let err = retry_serializable("fails_hard", move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Config("boom".into()))
        }
    })
    .await
    .unwrap_err();

    assert_eq!(err.code(), "config_error");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
