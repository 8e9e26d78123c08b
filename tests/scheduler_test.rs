//! Maintenance scheduler overlap and failure handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dialdesk::engine::scheduler::{
    MaintenanceReport, MaintenanceRunner, MaintenanceScheduler, TickOutcome,
};
use dialdesk::error::{Error, Result};
use tokio::sync::Notify;

/// Blocks inside the cycle until the test opens the gate.
#[derive(Default)]
struct GatedRunner {
    started: Notify,
    gate: Notify,
    runs: AtomicUsize,
}

#[async_trait]
impl MaintenanceRunner for GatedRunner {
    async fn run_maintenance_cycle(&self) -> Result<MaintenanceReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.gate.notified().await;
        Ok(MaintenanceReport::default())
    }
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let runner = Arc::new(GatedRunner::default());
    let scheduler = MaintenanceScheduler::new(Arc::clone(&runner), Duration::from_secs(60));

    let first = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.tick().await })
    };
    runner.started.notified().await;

    assert!(matches!(scheduler.tick().await, TickOutcome::Skipped));

    runner.gate.notify_one();
    assert!(matches!(first.await.unwrap(), TickOutcome::Ran(_)));
    assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

    // The flag is cleared once the cycle finishes.
    let second = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.tick().await })
    };
    runner.started.notified().await;
    runner.gate.notify_one();
    assert!(matches!(second.await.unwrap(), TickOutcome::Ran(_)));
    assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
}

/// Fails its first cycle, then reports a chase task.
#[derive(Default)]
struct FlakyRunner {
    calls: AtomicUsize,
}

#[async_trait]
impl MaintenanceRunner for FlakyRunner {
    async fn run_maintenance_cycle(&self) -> Result<MaintenanceReport> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Other("connection reset".into()));
        }
        Ok(MaintenanceReport {
            chase_tasks_created: 1,
            ..MaintenanceReport::default()
        })
    }
}

#[tokio::test]
async fn failed_cycle_does_not_block_the_next() {
    let scheduler =
        MaintenanceScheduler::new(Arc::new(FlakyRunner::default()), Duration::from_secs(60));

    match scheduler.tick().await {
        TickOutcome::Failed(e) => assert_eq!(e.to_string(), "connection reset"),
        other => panic!("expected failure, got {other:?}"),
    }
    match scheduler.tick().await {
        TickOutcome::Ran(report) => assert_eq!(report.chase_tasks_created, 1),
        other => panic!("expected a run, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn run_loop_ticks_until_shutdown() {
    let runner = Arc::new(FlakyRunner::default());
    let scheduler = MaintenanceScheduler::new(Arc::clone(&runner), Duration::from_secs(60));

    let handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::time::sleep(Duration::from_secs(150)).await;
    scheduler.shutdown();
    handle.await.unwrap();

    // Immediate first tick, then one at 60s and one at 120s.
    assert!(runner.calls.load(Ordering::SeqCst) >= 2);
}
