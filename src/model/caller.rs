//! Callers and experts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transition::TransitionMap;

/// A human agent who executes call tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub id: Uuid,
    pub allocation_status: AllocationStatus,
    /// ISO country codes the caller may dial into.
    pub region_codes: Vec<String>,
    pub language_codes: Vec<String>,
    /// IANA zone name, when known.
    pub timezone: Option<String>,
    pub fraud_status: FraudStatus,
    pub created_at: DateTime<Utc>,
}

status_enum! {
    /// A caller's current eligibility to receive tasks.
    pub enum AllocationStatus {
        WarmupGrace => "WARMUP_GRACE",
        Active => "ACTIVE",
        AtRisk => "AT_RISK",
        PausedLowDialRate => "PAUSED_LOW_DIAL_RATE",
        IdleNoAvailableTasks => "IDLE_NO_AVAILABLE_TASKS",
        RestrictedFraud => "RESTRICTED_FRAUD",
        Suspended => "SUSPENDED",
    }
}

impl AllocationStatus {
    /// Statuses that may be handed new tasks.
    pub const ASSIGNABLE: [AllocationStatus; 3] = [
        AllocationStatus::Active,
        AllocationStatus::WarmupGrace,
        AllocationStatus::AtRisk,
    ];

    /// Statuses the maintenance loop keeps nudging.
    pub const ACTIVE_ISH: [AllocationStatus; 5] = [
        AllocationStatus::WarmupGrace,
        AllocationStatus::Active,
        AllocationStatus::AtRisk,
        AllocationStatus::PausedLowDialRate,
        AllocationStatus::IdleNoAvailableTasks,
    ];

    pub fn can_receive_tasks(self) -> bool {
        Self::ASSIGNABLE.contains(&self)
    }

    /// Fraud outcomes are absorbing for every automated path.
    pub fn is_fraud_locked(self) -> bool {
        matches!(
            self,
            AllocationStatus::RestrictedFraud | AllocationStatus::Suspended
        )
    }
}

const ELIGIBILITY_EXITS: &[AllocationStatus] = &[
    AllocationStatus::WarmupGrace,
    AllocationStatus::Active,
    AllocationStatus::AtRisk,
    AllocationStatus::PausedLowDialRate,
    AllocationStatus::IdleNoAvailableTasks,
    AllocationStatus::RestrictedFraud,
    AllocationStatus::Suspended,
];

/// Allowed caller allocation-status transitions. Restriction only
/// escalates; suspension has no automated exit.
pub const CALLER_TRANSITIONS: TransitionMap<AllocationStatus> = &[
    (AllocationStatus::WarmupGrace, ELIGIBILITY_EXITS),
    (AllocationStatus::Active, ELIGIBILITY_EXITS),
    (AllocationStatus::AtRisk, ELIGIBILITY_EXITS),
    (AllocationStatus::PausedLowDialRate, ELIGIBILITY_EXITS),
    (AllocationStatus::IdleNoAvailableTasks, ELIGIBILITY_EXITS),
    (
        AllocationStatus::RestrictedFraud,
        &[AllocationStatus::Suspended],
    ),
    (AllocationStatus::Suspended, &[]),
];

status_enum! {
    pub enum FraudStatus {
        Clear => "CLEAR",
        Restricted => "RESTRICTED",
        Suspended => "SUSPENDED",
    }
}

/// A person being called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expert {
    pub id: Uuid,
    pub status: ExpertStatus,
    pub country_code: String,
    pub timezone: Option<String>,
    pub language_codes: Vec<String>,
}

status_enum! {
    pub enum ExpertStatus {
        Active => "ACTIVE",
        /// Terminal. Suppressed experts get no new tasks.
        Suppressed => "SUPPRESSED",
    }
}

/// Parameters for onboarding a caller.
#[derive(Debug, Clone)]
pub struct NewCaller {
    pub region_codes: Vec<String>,
    pub language_codes: Vec<String>,
    pub timezone: Option<String>,
    pub allocation_status: AllocationStatus,
}

impl NewCaller {
    pub fn new() -> Self {
        Self {
            region_codes: Vec::new(),
            language_codes: Vec::new(),
            timezone: None,
            allocation_status: AllocationStatus::WarmupGrace,
        }
    }

    pub fn regions<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.region_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn languages<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.language_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn status(mut self, status: AllocationStatus) -> Self {
        self.allocation_status = status;
        self
    }
}

impl Default for NewCaller {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters for registering an expert.
#[derive(Debug, Clone)]
pub struct NewExpert {
    pub country_code: String,
    pub timezone: Option<String>,
    pub language_codes: Vec<String>,
}

impl NewExpert {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
            timezone: None,
            language_codes: Vec::new(),
        }
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn languages<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.language_codes = codes.into_iter().map(Into::into).collect();
        self
    }
}
