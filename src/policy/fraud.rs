//! Call fraud heuristics.

use crate::config::Enforcement;
use crate::model::{AllocationStatus, FraudStatus};

/// Facts about one ended call and the caller's recent history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FraudInputs<'a> {
    pub duration_seconds: i32,
    pub caller_timezone: Option<&'a str>,
    pub expert_timezone: Option<&'a str>,
    /// Short or flagged calls by this caller inside the fraud window,
    /// this call included.
    pub recent_flagged_calls: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FraudAssessment {
    pub is_short: bool,
    pub timezone_mismatch: bool,
    pub is_fraud: bool,
    pub should_escalate: bool,
}

pub fn evaluate_fraud(inputs: FraudInputs<'_>, policy: &Enforcement) -> FraudAssessment {
    let is_short = inputs.duration_seconds < policy.min_call_duration_seconds;
    let timezone_mismatch = match (inputs.caller_timezone, inputs.expert_timezone) {
        (Some(caller), Some(expert)) => caller != expert,
        _ => false,
    };
    let is_fraud = is_short || timezone_mismatch;

    FraudAssessment {
        is_short,
        timezone_mismatch,
        is_fraud,
        should_escalate: is_fraud && inputs.recent_flagged_calls >= policy.fraud_escalation_count,
    }
}

/// Where a fraudulent call leaves the caller. Suspension never
/// de-escalates back to restriction.
pub fn fraud_target(
    current: AllocationStatus,
    should_escalate: bool,
) -> (AllocationStatus, FraudStatus) {
    if should_escalate || current == AllocationStatus::Suspended {
        (AllocationStatus::Suspended, FraudStatus::Suspended)
    } else {
        (AllocationStatus::RestrictedFraud, FraudStatus::Restricted)
    }
}
