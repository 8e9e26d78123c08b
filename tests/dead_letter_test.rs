//! Dead-letter routing against an in-memory sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dialdesk::clock::FixedClock;
use dialdesk::engine::dead_letter::{DeadLetterRouter, DeadLetterSink, RouteDecision};
use dialdesk::error::{Error, Result};
use dialdesk::model::{DeadLetterEntry, JobFailure, NewDeadLetter};
use serde_json::json;

#[derive(Default)]
struct MemorySink {
    entries: Mutex<Vec<NewDeadLetter>>,
    fail: AtomicBool,
}

impl MemorySink {
    fn stored(&self) -> Vec<NewDeadLetter> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemorySink {
    async fn persist(&self, entry: NewDeadLetter) -> Result<DeadLetterEntry> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Other("dead letter store unavailable".into()));
        }
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry.clone());
        Ok(DeadLetterEntry {
            id: entries.len() as i64,
            queue_name: entry.queue_name,
            job_id: entry.job_id,
            payload: entry.payload,
            error_message: entry.error_message,
            stack_trace: entry.stack_trace,
            correlation_id: entry.correlation_id,
            failed_at: entry.failed_at,
            archived_at: None,
        })
    }
}

fn router() -> DeadLetterRouter<MemorySink> {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 8, 30, 0).unwrap());
    DeadLetterRouter::new(MemorySink::default(), Arc::new(clock))
}

fn failure(attempts_made: u32) -> JobFailure {
    JobFailure {
        queue_name: "call_events".into(),
        job_id: Some("42".into()),
        attempts_made,
        configured_attempts: 5,
        error_message: "task row locked".into(),
        stack_trace: Some("at process_event".into()),
    }
}

#[tokio::test]
async fn final_attempt_is_dead_lettered_once() {
    let router = router();
    let payload = json!({ "correlation_id": "corr-1", "data": { "call_id": "c-9" } });

    let decision = router
        .on_job_failed(&failure(5), Some(&payload))
        .await
        .unwrap();

    let RouteDecision::DeadLettered(entry) = decision else {
        panic!("expected dead letter, got {decision:?}");
    };
    assert_eq!(entry.queue_name, "call_events");
    assert_eq!(entry.job_id, "42");
    assert_eq!(entry.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(entry.payload, payload);
    assert_eq!(
        entry.failed_at,
        Utc.with_ymd_and_hms(2026, 4, 1, 8, 30, 0).unwrap()
    );
    assert_eq!(router.sink().stored().len(), 1);
}

#[tokio::test]
async fn earlier_attempts_are_left_for_retry() {
    let router = router();
    let decision = router
        .on_job_failed(&failure(2), Some(&json!({})))
        .await
        .unwrap();

    assert!(matches!(
        decision,
        RouteDecision::RetryScheduled {
            attempts_made: 2,
            configured_attempts: 5
        }
    ));
    assert!(!decision.is_dead_lettered());
    assert!(router.sink().stored().is_empty());
}

#[tokio::test]
async fn missing_payload_is_recorded_as_unavailable() {
    let router = router();
    let mut lost = failure(5);
    lost.job_id = None;

    let decision = router
        .on_job_failed(&lost, None::<&serde_json::Value>)
        .await
        .unwrap();

    let RouteDecision::DeadLettered(entry) = decision else {
        panic!("expected dead letter");
    };
    assert_eq!(entry.payload, json!({ "unavailable": true }));
    assert_eq!(entry.job_id, "unknown");
    assert_eq!(entry.correlation_id, None);
}

#[tokio::test]
async fn unserializable_payload_gets_a_sentinel() {
    let router = router();
    // Maps with non-string keys cannot become JSON objects.
    let mut payload: HashMap<(u8, u8), u8> = HashMap::new();
    payload.insert((1, 2), 3);

    let decision = router
        .on_job_failed(&failure(5), Some(&payload))
        .await
        .unwrap();

    let RouteDecision::DeadLettered(entry) = decision else {
        panic!("expected dead letter");
    };
    assert_eq!(
        entry.payload,
        json!({ "serialization_error": "payload_not_serializable" })
    );
}

#[tokio::test]
async fn sink_failure_is_returned_to_the_transport() {
    let router = router();
    router.sink().fail.store(true, Ordering::SeqCst);

    let err = router
        .on_job_failed(&failure(5), Some(&json!({ "correlation_id": "corr-2" })))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "internal_error");
    assert!(router.sink().stored().is_empty());
}
