//! Periodic maintenance.
//!
//! A tick that fires while the previous cycle is still running is skipped,
//! not queued. A failing cycle is logged and the next tick runs normally.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, error, info, warn};

use crate::config::SchedulerSettings;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{
    AllocationNudge, JobEnvelope, PerformanceRecompute, QueueName, SYSTEM_CORRELATION_ID,
};
use crate::telemetry::metrics;
use crate::telemetry::spans::start_maintenance_span;

/// Per-step counts from one maintenance cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub dead_letters_archived: u64,
    pub callers_nudged: usize,
    pub screening_follow_ups: usize,
    pub chase_tasks_created: usize,
    pub assignments_expired: usize,
    /// Steps that errored. The remaining steps still ran.
    pub failed_steps: Vec<&'static str>,
}

#[async_trait]
pub trait MaintenanceRunner: Send + Sync {
    async fn run_maintenance_cycle(&self) -> Result<MaintenanceReport>;
}

/// The production maintenance cycle against Postgres.
pub struct DbMaintenance {
    db: Arc<Db>,
    settings: SchedulerSettings,
}

impl DbMaintenance {
    pub fn new(db: Arc<Db>, settings: SchedulerSettings) -> Self {
        Self { db, settings }
    }

    async fn nudge_active_callers(&self) -> Result<usize> {
        let caller_ids = self.db.active_caller_ids().await?;
        for caller_id in &caller_ids {
            let caller_id = *caller_id;
            self.db
                .send_job(
                    QueueName::Performance,
                    &JobEnvelope::new(SYSTEM_CORRELATION_ID, PerformanceRecompute { caller_id }),
                )
                .await?;
            self.db
                .send_job(
                    QueueName::CallAllocation,
                    &JobEnvelope::new(SYSTEM_CORRELATION_ID, AllocationNudge { caller_id }),
                )
                .await?;
        }
        Ok(caller_ids.len())
    }
}

/// Log a failed step and remember its name.
fn settle<T: Default>(step: &'static str, result: Result<T>, failed: &mut Vec<&'static str>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!(step, "maintenance step failed: {e}");
            failed.push(step);
            T::default()
        }
    }
}

#[async_trait]
impl MaintenanceRunner for DbMaintenance {
    async fn run_maintenance_cycle(&self) -> Result<MaintenanceReport> {
        let now = self.db.now();
        let s = &self.settings;
        let mut failed = Vec::new();

        let dead_letters_archived = settle(
            "archive_dead_letters",
            self.db
                .archive_dead_letters_older_than(
                    now - chrono::Duration::days(s.dead_letter_retention_days),
                )
                .await,
            &mut failed,
        );
        let callers_nudged = settle(
            "nudge_callers",
            self.nudge_active_callers().await,
            &mut failed,
        );
        let screening_follow_ups = settle(
            "screening_follow_ups",
            self.db
                .enqueue_screening_follow_ups(
                    now - chrono::Duration::minutes(s.screening_stall_minutes),
                )
                .await,
            &mut failed,
        );
        let chase_tasks_created = settle(
            "signup_chases",
            self.db
                .spawn_signup_chases(
                    now - chrono::Duration::hours(s.chase_after_hours),
                    s.chase_daily_limit,
                )
                .await,
            &mut failed,
        );
        let assignments_expired = settle(
            "expire_assignments",
            self.db.expire_lapsed_assignments().await,
            &mut failed,
        );

        Ok(MaintenanceReport {
            dead_letters_archived,
            callers_nudged,
            screening_follow_ups,
            chase_tasks_created,
            assignments_expired,
            failed_steps: failed,
        })
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    Ran(MaintenanceReport),
    Failed(Error),
    /// A previous cycle was still running.
    Skipped,
}

/// Clears the in-progress flag even if the cycle panics.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fires the maintenance cycle on a fixed interval.
pub struct MaintenanceScheduler<R> {
    runner: Arc<R>,
    interval: Duration,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl<R> Clone for MaintenanceScheduler<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            interval: self.interval,
            running: Arc::clone(&self.running),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<R: MaintenanceRunner + 'static> MaintenanceScheduler<R> {
    pub fn new(runner: Arc<R>, interval: Duration) -> Self {
        Self {
            runner,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run one cycle unless one is already in progress.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("maintenance cycle still running; tick skipped");
            return TickOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let span = start_maintenance_span();
        let started = Instant::now();
        let result = self
            .runner
            .run_maintenance_cycle()
            .instrument(span)
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::operation_duration_ms()
            .record(elapsed_ms, &[KeyValue::new("operation", "maintenance_cycle")]);

        match result {
            Ok(report) => {
                info!(
                    dead_letters_archived = report.dead_letters_archived,
                    callers_nudged = report.callers_nudged,
                    screening_follow_ups = report.screening_follow_ups,
                    chase_tasks_created = report.chase_tasks_created,
                    assignments_expired = report.assignments_expired,
                    failed_steps = ?report.failed_steps,
                    elapsed_ms,
                    "maintenance cycle completed"
                );
                TickOutcome::Ran(report)
            }
            Err(e) => {
                error!("maintenance cycle failed: {e}");
                TickOutcome::Failed(e)
            }
        }
    }

    /// Tick on the interval until shutdown. Each tick runs as its own task
    /// so a slow cycle cannot delay the timer.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "maintenance scheduler started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("maintenance scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.tick().await;
                    });
                }
            }
        }
    }
}
