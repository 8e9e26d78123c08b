//! # dialdesk
//!
//! Postgres-backed call-task allocation engine.
//!
//! Hands outbound-call tasks to human callers one at a time, applies
//! provider call events exactly once, polices fraud and dial-rate
//! thresholds, and keeps the whole thing moving with pgmq workers and a
//! maintenance scheduler.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod policy;
pub mod telemetry;
pub mod transition;
pub mod webhook;
