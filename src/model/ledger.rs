//! Idempotency ledger entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// First-seen record of an externally sourced event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub event_id: String,
    /// SHA-256 of the payload, kept for forensic comparison only.
    pub payload_hash: String,
    pub status: LedgerStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Accepted,
    Processed,
    Orphaned,
}

impl LedgerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerStatus::Accepted => "accepted",
            LedgerStatus::Processed => "processed",
            LedgerStatus::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "accepted" => Ok(LedgerStatus::Accepted),
            "processed" => Ok(LedgerStatus::Processed),
            "orphaned" => Ok(LedgerStatus::Orphaned),
            other => Err(crate::error::Error::Other(format!(
                "unknown ledger status: {other}"
            ))),
        }
    }
}

/// Result of webhook intake.
#[derive(Debug)]
pub enum Intake {
    /// First delivery: registered and queued for processing.
    Accepted {
        entry: Box<IdempotencyEntry>,
        job_msg_id: i64,
    },
    /// Seen before. Acknowledge without side effects.
    Duplicate { event_id: String },
}

impl Intake {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Intake::Duplicate { .. })
    }
}
