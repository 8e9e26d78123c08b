//! Span helpers for jobs and maintenance cycles, plus transition recording.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;

/// Start a span for one job delivery.
///
/// `job.outcome` is declared empty and filled in by the worker once the
/// handler returns.
pub fn start_job_span(queue: &str, msg_id: i64, attempt: i32) -> Span {
    tracing::info_span!(
        "job.handle",
        "job.queue" = queue,
        "job.msg_id" = msg_id,
        "job.attempt" = attempt,
        "job.correlation_id" = tracing::field::Empty,
        "job.outcome" = tracing::field::Empty,
    )
}

pub fn start_maintenance_span() -> Span {
    tracing::info_span!("maintenance.cycle")
}

/// Count a guarded state change and log it on the current span.
pub fn record_state_transition(entity: &'static str, from: &str, to: &str) {
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("entity", entity),
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
    tracing::info!(entity, from, to, "state_transition");
}
