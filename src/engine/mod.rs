//! Background machinery that runs alongside the database.

pub mod dead_letter;
pub mod scheduler;
pub mod worker;

pub use dead_letter::{DeadLetterRouter, DeadLetterSink, RouteDecision};
pub use scheduler::{
    DbMaintenance, MaintenanceReport, MaintenanceRunner, MaintenanceScheduler, TickOutcome,
};
pub use worker::{JobHandler, QueueWorker, WorkerConfig};
