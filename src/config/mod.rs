//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// HMAC secret for provider webhooks. Intake refuses to verify without it.
    pub webhook_secret: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub enforcement: Enforcement,
    pub scheduler: SchedulerSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            webhook_secret: std::env::var("WEBHOOK_SECRET").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            enforcement: Enforcement::from_env()?,
            scheduler: SchedulerSettings::from_env()?,
        })
    }
}

/// Business thresholds for fraud and dial-rate enforcement.
///
/// Deployment-wide, not per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enforcement {
    /// Calls shorter than this are short (and fraudulent).
    pub min_call_duration_seconds: i32,
    pub dials_per_hour_target: i32,
    pub at_risk_after_minutes: i32,
    pub pause_after_minutes: i32,
    pub fraud_window_minutes: i64,
    /// Fraud/short calls within the window that trigger suspension.
    pub fraud_escalation_count: i64,
    pub warmup_minutes: i64,
    /// How long an assignment stays valid.
    pub assignment_window_minutes: i64,
}

impl Default for Enforcement {
    fn default() -> Self {
        Self {
            min_call_duration_seconds: 10,
            dials_per_hour_target: 30,
            at_risk_after_minutes: 5,
            pause_after_minutes: 10,
            fraud_window_minutes: 10,
            fraud_escalation_count: 3,
            warmup_minutes: 60,
            assignment_window_minutes: 15,
        }
    }
}

impl Enforcement {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            min_call_duration_seconds: parsed_var(
                "MIN_CALL_DURATION_SECONDS",
                d.min_call_duration_seconds,
            )?,
            dials_per_hour_target: parsed_var("DIALS_PER_HOUR_TARGET", d.dials_per_hour_target)?,
            at_risk_after_minutes: parsed_var("AT_RISK_AFTER_MINUTES", d.at_risk_after_minutes)?,
            pause_after_minutes: parsed_var("PAUSE_AFTER_MINUTES", d.pause_after_minutes)?,
            fraud_window_minutes: parsed_var("FRAUD_WINDOW_MINUTES", d.fraud_window_minutes)?,
            fraud_escalation_count: parsed_var(
                "FRAUD_ESCALATION_COUNT",
                d.fraud_escalation_count,
            )?,
            warmup_minutes: parsed_var("WARMUP_MINUTES", d.warmup_minutes)?,
            assignment_window_minutes: parsed_var(
                "ASSIGNMENT_WINDOW_MINUTES",
                d.assignment_window_minutes,
            )?,
        })
    }
}

/// Cadence and retention knobs for the maintenance scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub dead_letter_retention_days: i64,
    pub screening_stall_minutes: i64,
    pub chase_after_hours: i64,
    pub chase_daily_limit: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            dead_letter_retention_days: 30,
            screening_stall_minutes: 30,
            chase_after_hours: 24,
            chase_daily_limit: 2,
        }
    }
}

impl SchedulerSettings {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let interval_secs: u64 = parsed_var("SCHEDULER_INTERVAL_SECONDS", d.interval.as_secs())?;
        if interval_secs == 0 {
            return Err(Error::Config(
                "SCHEDULER_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            interval: Duration::from_secs(interval_secs),
            dead_letter_retention_days: parsed_var(
                "DEAD_LETTER_RETENTION_DAYS",
                d.dead_letter_retention_days,
            )?,
            screening_stall_minutes: parsed_var(
                "SCREENING_STALL_MINUTES",
                d.screening_stall_minutes,
            )?,
            chase_after_hours: parsed_var("CHASE_AFTER_HOURS", d.chase_after_hours)?,
            chase_daily_limit: parsed_var("CHASE_DAILY_LIMIT", d.chase_daily_limit)?,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name}: {raw:?} ({e})"))),
        Err(_) => Ok(default),
    }
}
