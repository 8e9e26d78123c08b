//! dialdesk CLI: operator interface to the allocation engine.

use clap::{Parser, Subcommand};
use dialdesk::clock;
use dialdesk::config::Config;
use dialdesk::db::Db;
use dialdesk::engine::worker::{AllocationHandler, CallEventHandler, PerformanceHandler};
use dialdesk::engine::{
    DbMaintenance, DeadLetterRouter, JobHandler, MaintenanceScheduler, QueueWorker, WorkerConfig,
};
use dialdesk::model::{Intake, TaskFilters, TaskStatus};
use dialdesk::telemetry::init_telemetry;
use dialdesk::webhook::{self, WebhookHeaders};
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dialdesk", about = "Call-task allocation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue workers
    Serve {
        /// Visibility timeout (seconds) for claimed jobs
        #[arg(long, default_value_t = 30)]
        visibility_timeout: i32,
    },
    /// Run the maintenance scheduler
    Scheduler,
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Caller operations
    Caller {
        #[command(subcommand)]
        action: CallerAction,
    },
    /// Dead-letter operations
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Verify and ingest a captured provider webhook delivery
    Ingest {
        /// File holding the raw request body
        body: PathBuf,
        #[arg(long)]
        signature: String,
        #[arg(long)]
        timestamp: String,
        #[arg(long)]
        event_id: String,
    },
    /// Show the audit trail for one entity
    Events {
        /// task, caller, or call
        entity_type: String,
        entity_id: String,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks, newest first
    List {
        /// Filter by status (PENDING, ASSIGNED, ...)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        caller: Option<Uuid>,
        #[arg(long)]
        project: Option<Uuid>,
        #[arg(long)]
        expert: Option<Uuid>,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Put a task back in the pool
    Requeue {
        task_id: Uuid,
        /// Why the task is being requeued
        #[arg(long)]
        reason: String,
        /// Operator name recorded in the audit trail
        #[arg(long, env = "USER", default_value = "operator")]
        operator: String,
    },
}

#[derive(Subcommand)]
enum CallerAction {
    /// Recalculate rolling performance and allocation status
    Recalc { caller_id: Uuid },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// List unarchived dead letters
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { visibility_timeout } => cmd_serve(config, visibility_timeout).await,
        Command::Scheduler => cmd_scheduler(config).await,
        Command::Task { action } => {
            let db = connect(&config).await?;
            match action {
                TaskAction::List {
                    status,
                    caller,
                    project,
                    expert,
                    limit,
                } => cmd_task_list(&db, status, caller, project, expert, limit).await,
                TaskAction::Requeue {
                    task_id,
                    reason,
                    operator,
                } => cmd_task_requeue(&db, task_id, &operator, &reason).await,
            }
        }
        Command::Caller {
            action: CallerAction::Recalc { caller_id },
        } => {
            let db = connect(&config).await?;
            cmd_caller_recalc(&db, caller_id).await
        }
        Command::DeadLetters {
            action: DeadLetterAction::List { limit },
        } => {
            let db = connect(&config).await?;
            cmd_dead_letters_list(&db, limit).await
        }
        Command::Ingest {
            body,
            signature,
            timestamp,
            event_id,
        } => {
            let db = connect(&config).await?;
            let headers = WebhookHeaders {
                signature: Some(signature),
                timestamp: Some(timestamp),
                event_id: Some(event_id),
            };
            cmd_ingest(&db, &config, &body, &headers).await
        }
        Command::Events {
            entity_type,
            entity_id,
        } => {
            let db = connect(&config).await?;
            cmd_events(&db, &entity_type, &entity_id).await
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret())
        .await?
        .with_enforcement(config.enforcement);
    db.migrate().await?;
    db.create_queues().await?;
    Ok(db)
}

async fn cmd_serve(config: Config, visibility_timeout: i32) -> anyhow::Result<()> {
    let _guard = init_telemetry(&config, "workers")?;

    let db = Arc::new(connect(&config).await?);
    let router = Arc::new(DeadLetterRouter::new((*db).clone(), clock::system()));
    let worker_config = WorkerConfig {
        visibility_timeout,
        ..WorkerConfig::default()
    };

    let handlers: Vec<Arc<dyn JobHandler>> = vec![
        Arc::new(CallEventHandler::new(Arc::clone(&db))),
        Arc::new(AllocationHandler::new(Arc::clone(&db))),
        Arc::new(PerformanceHandler::new(Arc::clone(&db))),
    ];
    let workers: Vec<QueueWorker> = handlers
        .into_iter()
        .map(|handler| {
            QueueWorker::new(
                Arc::clone(&db),
                handler,
                Arc::clone(&router),
                worker_config.clone(),
            )
        })
        .collect();

    let stoppers = workers.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        for worker in &stoppers {
            worker.shutdown();
        }
    });

    let mut tasks = tokio::task::JoinSet::new();
    for worker in workers {
        tasks.spawn(async move { worker.run().await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    Ok(())
}

async fn cmd_scheduler(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(&config, "scheduler")?;

    let db = Arc::new(connect(&config).await?);
    let runner = Arc::new(DbMaintenance::new(db, config.scheduler));
    let scheduler = MaintenanceScheduler::new(runner, config.scheduler.interval);

    let stopper = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stopper.shutdown();
    });

    scheduler.run().await;
    Ok(())
}

async fn cmd_task_list(
    db: &Db,
    status: Option<String>,
    caller_id: Option<Uuid>,
    project_id: Option<Uuid>,
    expert_id: Option<Uuid>,
    limit: i64,
) -> anyhow::Result<()> {
    let status: Option<TaskStatus> = match status {
        Some(s) => Some(
            s.to_uppercase()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let tasks = db
        .list_for_operators(&TaskFilters {
            status,
            caller_id,
            project_id,
            expert_id,
            limit: Some(limit),
        })
        .await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<4}  {:<5}  {:<8}  CREATED",
        "ID", "STATUS", "PRI", "DIALS", "CALLER"
    );
    println!("{}", "-".repeat(64));

    for task in &tasks {
        let short_id = &task.id.to_string()[..8];
        let caller = task
            .caller_id
            .map(|id| id.to_string()[..8].to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8}  {:<10}  {:<4}  {:<5}  {:<8}  {}",
            short_id,
            task.status,
            task.priority_score,
            task.attempted_dial_count,
            caller,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_task_requeue(
    db: &Db,
    task_id: Uuid,
    operator: &str,
    reason: &str,
) -> anyhow::Result<()> {
    let receipt = db.requeue_by_operator(task_id, operator, reason).await?;
    match receipt.cancelled {
        Some(cancelled) => println!(
            "Cancelled {} ({}); new pending task {}",
            cancelled.id, cancelled.status, receipt.pending.id
        ),
        None => println!("Task {} stays pending; audit recorded", receipt.pending.id),
    }
    Ok(())
}

async fn cmd_caller_recalc(db: &Db, caller_id: Uuid) -> anyhow::Result<()> {
    let Some(snapshot) = db.recalculate_for_caller(caller_id).await? else {
        anyhow::bail!("caller {caller_id} not found");
    };

    println!("Caller:       {}", snapshot.caller_id);
    println!("Status:       {}", snapshot.derived_allocation_status);
    println!("Dials (60m):  {}", snapshot.rolling_60min_dials);
    println!("Connections:  {}", snapshot.rolling_60min_connections);
    println!("Valid:        {}", snapshot.rolling_60min_valid_connections);
    println!("Short calls:  {}", snapshot.short_calls_last_hour);
    println!("Low rate:     {} min", snapshot.low_rate_minutes);
    println!("Warmup:       {}", snapshot.warmup_active);
    Ok(())
}

async fn cmd_dead_letters_list(db: &Db, limit: i64) -> anyhow::Result<()> {
    let entries = db.list_active_dead_letters(limit).await?;
    if entries.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    for entry in &entries {
        println!(
            "#{:<6} {:<20} job={:<10} corr={} at {}",
            entry.id,
            entry.queue_name,
            entry.job_id,
            entry.correlation_id.as_deref().unwrap_or("-"),
            entry.failed_at.format("%Y-%m-%d %H:%M")
        );
        println!("        {}", entry.error_message);
    }
    println!("\n{} dead letter(s)", entries.len());
    Ok(())
}

async fn cmd_ingest(
    db: &Db,
    config: &Config,
    body: &Path,
    headers: &WebhookHeaders,
) -> anyhow::Result<()> {
    let raw_body = std::fs::read(body)?;
    let correlation_id = Uuid::new_v4().to_string();
    let intake = webhook::receive(
        db,
        headers,
        &raw_body,
        config.webhook_secret.as_ref(),
        &correlation_id,
    )
    .await?;

    match intake {
        Intake::Accepted { entry, job_msg_id } => println!(
            "Accepted {} (job {job_msg_id}, correlation {correlation_id})",
            entry.event_id
        ),
        Intake::Duplicate { event_id } => println!("Duplicate {event_id}; already processed"),
    }
    Ok(())
}

async fn cmd_events(db: &Db, entity_type: &str, entity_id: &str) -> anyhow::Result<()> {
    let events = db.list_system_events(entity_type, entity_id).await?;
    if events.is_empty() {
        println!("No events for {entity_type} {entity_id}.");
        return Ok(());
    }

    for event in &events {
        println!(
            "{}  {:<12} {}  corr={}",
            event.created_at.format("%Y-%m-%d %H:%M:%S"),
            event.category.as_str(),
            event.message,
            event.correlation_id.as_deref().unwrap_or("-"),
        );
        println!("    {}", event.payload);
    }
    Ok(())
}
