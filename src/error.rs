//! Error types for dialdesk.
//!
//! Every variant carries a stable machine-readable code (see [`Error::code`])
//! and an HTTP-style status (see [`Error::status`]) so that whatever surface
//! sits in front of the engine can render a structured error without
//! matching on messages.

use thiserror::Error;

/// Partial unique index allowing one ASSIGNED/DIALING task per caller.
pub(crate) const IN_FLIGHT_CONSTRAINT: &str = "tasks_one_in_flight_per_caller";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {entity} transition: {from} -> {to} (allowed: {allowed:?})")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    #[error("duplicate webhook event: {event_id}")]
    DuplicateWebhookEvent { event_id: String },

    #[error("caller not found: {0}")]
    CallerNotFound(uuid::Uuid),

    #[error("task {task_id} not found for caller {caller_id}")]
    TaskNotFoundForCaller {
        caller_id: uuid::Uuid,
        task_id: uuid::Uuid,
    },

    #[error("task not found: {0}")]
    TaskNotFound(uuid::Uuid),

    #[error("task {task_id} cannot be requeued from state {status}")]
    InvalidRequeueState { task_id: uuid::Uuid, status: String },

    #[error("serializable transaction retry exhausted after {attempts} attempts")]
    SerializationRetryExhausted { attempts: u32 },

    #[error("provider request failed: {provider}: {reason}")]
    ProviderRequestFailed { provider: String, reason: String },

    #[error("invalid webhook: {code}")]
    InvalidWebhook { code: &'static str, status: u16 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable snake_case code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidTransition { .. } => "invalid_state_transition",
            Error::DuplicateWebhookEvent { .. } => "duplicate_webhook_event",
            Error::CallerNotFound(_) => "caller_not_found",
            Error::TaskNotFoundForCaller { .. } => "call_task_not_found",
            Error::TaskNotFound(_) => "task_not_found",
            Error::InvalidRequeueState { .. } => "invalid_requeue_state",
            Error::SerializationRetryExhausted { .. } => "serializable_transaction_retry_exhausted",
            Error::ProviderRequestFailed { .. } => "provider_request_failed",
            Error::InvalidWebhook { code, .. } => *code,
            Error::Database(_) => "database_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::Config(_) => "config_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// HTTP-equivalent status for the error class.
    pub fn status(&self) -> u16 {
        match self {
            Error::InvalidTransition { .. } | Error::DuplicateWebhookEvent { .. } => 409,
            Error::CallerNotFound(_)
            | Error::TaskNotFoundForCaller { .. }
            | Error::TaskNotFound(_) => 404,
            Error::InvalidRequeueState { .. } => 400,
            Error::InvalidWebhook { status, .. } => *status,
            Error::SerializationRetryExhausted { .. } => 503,
            Error::ProviderRequestFailed { .. } => 502,
            _ => 500,
        }
    }

    /// Duplicate deliveries are acknowledged, not failed.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateWebhookEvent { .. })
    }

    /// Whether the database aborted the transaction because of a concurrent
    /// writer: a serialization failure, a deadlock, or a second in-flight
    /// task for the same caller. All of these may simply run again.
    pub fn is_transaction_conflict(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => {
                match db_err.code().as_deref() {
                    Some("40001") | Some("40P01") => true,
                    Some("23505") => db_err.constraint() == Some(IN_FLIGHT_CONSTRAINT),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    pub(crate) fn webhook(code: &'static str, status: u16) -> Self {
        Error::InvalidWebhook { code, status }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
