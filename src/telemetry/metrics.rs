//! Metric instrument factories for dialdesk.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"dialdesk"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for dialdesk instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dialdesk")
}

/// Counter: webhook intake decisions.
/// Labels: `result` ("accepted" | "duplicate" | "error").
pub fn webhook_events() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.webhook.events")
        .with_description("Webhook events received, by intake decision")
        .build()
}

/// Counter: guarded state transitions.
/// Labels: `entity` ("task" | "caller"), `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.state_transitions")
        .with_description("Number of task and caller state transitions")
        .build()
}

/// Counter: allocation polls.
/// Labels: `result` ("assigned" | "existing" | "none" | "ineligible").
pub fn allocation_polls() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.allocation.polls")
        .with_description("Task allocation requests, by result")
        .build()
}

/// Counter: fraud enforcement actions.
/// Labels: `action` ("restricted" | "suspended").
pub fn fraud_enforcements() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.fraud.enforcements")
        .with_description("Callers restricted or suspended for fraud")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: failed job deliveries.
/// Labels: `queue`, `decision` ("retry" | "dead_letter").
pub fn job_failures() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.job.failures")
        .with_description("Failed job deliveries, by routing decision")
        .build()
}

/// Counter: serializable transactions that ran out of retries.
/// Labels: `operation`.
pub fn serialization_retry_exhausted() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.db.serialization_retry_exhausted")
        .with_description("Serializable transactions abandoned after retries")
        .build()
}

/// Counter: performance recalculations.
/// Labels: `status` (derived allocation status).
pub fn performance_recalculations() -> Counter<u64> {
    meter()
        .u64_counter("dialdesk.performance.recalculations")
        .with_description("Caller performance snapshots written")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dialdesk.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
