//! Queue workers: poll a pgmq queue, dispatch to a handler, retire the
//! message.
//!
//! A message is archived when its handler succeeds or when the dead-letter
//! router has persisted it. Otherwise it stays in the queue and reappears
//! after the visibility timeout, which is the transport's retry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, warn};

use super::dead_letter::{DeadLetterRouter, RouteDecision};
use crate::db::Db;
use crate::db::pgmq::PgmqMessage;
use crate::error::Result;
use crate::model::{
    AllocationNudge, CallEvent, JobEnvelope, JobFailure, PerformanceRecompute, QueueName,
};
use crate::telemetry::metrics;
use crate::telemetry::spans::start_job_span;

/// Handles the jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;

    async fn handle(&self, correlation_id: &str, data: Value) -> Result<()>;
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T> {
    Ok(serde_json::from_value(data)?)
}

/// Applies call lifecycle events.
pub struct CallEventHandler {
    db: Arc<Db>,
}

impl CallEventHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobHandler for CallEventHandler {
    fn queue(&self) -> QueueName {
        QueueName::CallEvents
    }

    async fn handle(&self, correlation_id: &str, data: Value) -> Result<()> {
        let event: CallEvent = decode(data)?;
        self.db.process_event(&event, Some(correlation_id)).await?;
        Ok(())
    }
}

/// Runs `fetch_or_assign` for nudged callers.
pub struct AllocationHandler {
    db: Arc<Db>,
}

impl AllocationHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobHandler for AllocationHandler {
    fn queue(&self) -> QueueName {
        QueueName::CallAllocation
    }

    async fn handle(&self, _correlation_id: &str, data: Value) -> Result<()> {
        let nudge: AllocationNudge = decode(data)?;
        self.db.fetch_or_assign(nudge.caller_id).await?;
        Ok(())
    }
}

/// Recomputes rolling performance.
pub struct PerformanceHandler {
    db: Arc<Db>,
}

impl PerformanceHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobHandler for PerformanceHandler {
    fn queue(&self) -> QueueName {
        QueueName::Performance
    }

    async fn handle(&self, _correlation_id: &str, data: Value) -> Result<()> {
        let job: PerformanceRecompute = decode(data)?;
        self.db.recalculate_for_caller(job.caller_id).await?;
        Ok(())
    }
}

/// Configuration for a queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Visibility timeout (seconds) for pgmq reads.
    pub visibility_timeout: i32,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Polls one queue until shutdown.
#[derive(Clone)]
pub struct QueueWorker {
    db: Arc<Db>,
    handler: Arc<dyn JobHandler>,
    router: Arc<DeadLetterRouter<Db>>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl QueueWorker {
    pub fn new(
        db: Arc<Db>,
        handler: Arc<dyn JobHandler>,
        router: Arc<DeadLetterRouter<Db>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            db,
            handler,
            router,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the worker to stop after the current job.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the poll loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        let queue = self.handler.queue();
        info!(%queue, "queue worker started");

        loop {
            // Drain whatever is visible, then wait.
            loop {
                match self.process_next().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(%queue, "process_next error: {e}");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(%queue, "queue worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Claim and handle one message. Returns false when the queue is empty.
    pub async fn process_next(&self) -> Result<bool> {
        let queue = self.handler.queue();
        let Some(msg) = self
            .db
            .read_job(queue, self.config.visibility_timeout)
            .await?
        else {
            return Ok(false);
        };

        let span = start_job_span(queue.as_str(), msg.msg_id, msg.read_ct);
        self.handle_message(queue, msg).instrument(span).await?;
        Ok(true)
    }

    async fn handle_message(&self, queue: QueueName, msg: PgmqMessage) -> Result<()> {
        let started = Instant::now();
        let span = tracing::Span::current();

        let result = match serde_json::from_value::<JobEnvelope<Value>>(msg.message.clone()) {
            Ok(envelope) => {
                span.record("job.correlation_id", envelope.correlation_id.as_str());
                self.handler
                    .handle(&envelope.correlation_id, envelope.data)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", format!("job.{queue}"))],
        );

        match result {
            Ok(()) => {
                span.record("job.outcome", "completed");
                self.db.archive_job(queue, msg.msg_id).await?;
            }
            Err(e) => {
                span.record("job.outcome", "failed");
                let failure = JobFailure {
                    queue_name: queue.as_str().to_string(),
                    job_id: Some(msg.msg_id.to_string()),
                    attempts_made: u32::try_from(msg.read_ct).unwrap_or(0),
                    configured_attempts: queue.configured_attempts(),
                    error_message: e.to_string(),
                    stack_trace: Some(format!("{e:?}")),
                };
                match self.router.on_job_failed(&failure, Some(&msg.message)).await? {
                    RouteDecision::DeadLettered(_) => {
                        self.db.archive_job(queue, msg.msg_id).await?;
                    }
                    RouteDecision::RetryScheduled { .. } => {
                        warn!(msg_id = msg.msg_id, "job left for redelivery");
                    }
                }
            }
        }
        Ok(())
    }
}
