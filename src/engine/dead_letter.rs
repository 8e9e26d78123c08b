//! Dead-letter routing for failed jobs.
//!
//! The transport reports every failed delivery here. Deliveries with
//! attempts left are left to the transport's own retry; the last one is
//! persisted through a [`DeadLetterSink`].

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::model::{DeadLetterEntry, JobFailure, NewDeadLetter};
use crate::telemetry::metrics;

/// Durable home for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn persist(&self, entry: NewDeadLetter) -> Result<DeadLetterEntry>;
}

#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Attempts remain; the transport will redeliver.
    RetryScheduled { attempts_made: u32, configured_attempts: u32 },
    DeadLettered(DeadLetterEntry),
}

impl RouteDecision {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, RouteDecision::DeadLettered(_))
    }
}

pub struct DeadLetterRouter<S> {
    sink: S,
    clock: SharedClock,
}

impl<S: DeadLetterSink> DeadLetterRouter<S> {
    pub fn new(sink: S, clock: SharedClock) -> Self {
        Self { sink, clock }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Route one failed delivery.
    ///
    /// A sink error is returned as-is so the transport keeps the message
    /// and redelivers it.
    pub async fn on_job_failed<P>(
        &self,
        failure: &JobFailure,
        payload: Option<&P>,
    ) -> Result<RouteDecision>
    where
        P: Serialize + Sync + ?Sized,
    {
        if !failure.is_exhausted() {
            record_failure(&failure.queue_name, "retry");
            warn!(
                queue = %failure.queue_name,
                job_id = failure.job_id.as_deref().unwrap_or("unknown"),
                attempts_made = failure.attempts_made,
                configured_attempts = failure.configured_attempts,
                error = %failure.error_message,
                "job failed; retry scheduled"
            );
            return Ok(RouteDecision::RetryScheduled {
                attempts_made: failure.attempts_made,
                configured_attempts: failure.configured_attempts,
            });
        }

        let payload = snapshot_payload(payload);
        let correlation_id = correlation_id_of(&payload);
        let entry = self
            .sink
            .persist(NewDeadLetter {
                queue_name: failure.queue_name.clone(),
                job_id: failure
                    .job_id
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                payload,
                error_message: failure.error_message.clone(),
                stack_trace: failure.stack_trace.clone(),
                correlation_id,
                failed_at: self.clock.now(),
            })
            .await?;

        record_failure(&failure.queue_name, "dead_letter");
        error!(
            queue = %entry.queue_name,
            job_id = %entry.job_id,
            dead_letter_id = entry.id,
            correlation_id = entry.correlation_id.as_deref().unwrap_or(""),
            error = %entry.error_message,
            "job dead-lettered"
        );
        Ok(RouteDecision::DeadLettered(entry))
    }
}

/// JSON form of a failed job's payload, with sentinels for a missing or
/// unserializable one.
pub fn snapshot_payload<P: Serialize + ?Sized>(payload: Option<&P>) -> Value {
    match payload {
        None => json!({ "unavailable": true }),
        Some(payload) => serde_json::to_value(payload)
            .unwrap_or_else(|_| json!({ "serialization_error": "payload_not_serializable" })),
    }
}

/// The envelope's `correlation_id`, when the payload carries one.
pub fn correlation_id_of(payload: &Value) -> Option<String> {
    payload
        .get("correlation_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn record_failure(queue: &str, decision: &'static str) {
    metrics::job_failures().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("decision", decision),
        ],
    );
}
