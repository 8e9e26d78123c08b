//! Caller allocation-status derivation.

use chrono::{DateTime, Utc};

use crate::config::Enforcement;
use crate::model::AllocationStatus;

/// Inputs to [`derive_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInputs {
    pub current: AllocationStatus,
    pub rolling_60min_dials: i32,
    pub low_rate_minutes: i32,
    pub warmup_active: bool,
}

/// Derive a caller's allocation status from rolling performance.
///
/// Fraud statuses are absorbing. Warmup wins over everything else; meeting
/// the dial target wins over a low-rate streak.
pub fn derive_status(inputs: StatusInputs, policy: &Enforcement) -> AllocationStatus {
    if inputs.current.is_fraud_locked() {
        return inputs.current;
    }
    if inputs.warmup_active {
        return AllocationStatus::WarmupGrace;
    }
    if inputs.rolling_60min_dials >= policy.dials_per_hour_target {
        return AllocationStatus::Active;
    }
    if inputs.low_rate_minutes >= policy.pause_after_minutes {
        return AllocationStatus::PausedLowDialRate;
    }
    if inputs.low_rate_minutes >= policy.at_risk_after_minutes {
        return AllocationStatus::AtRisk;
    }
    AllocationStatus::Active
}

/// Minutes since the start of the unbroken run of below-target windows
/// ending now.
///
/// `history` is prior snapshots as `(captured_at, rolling_60min_dials)`,
/// newest first. Returns 0 when the current window meets target.
pub fn low_rate_minutes(
    now: DateTime<Utc>,
    current_dials: i32,
    history: &[(DateTime<Utc>, i32)],
    target: i32,
) -> i32 {
    if current_dials >= target {
        return 0;
    }

    let streak_start = history
        .iter()
        .take_while(|(_, dials)| *dials < target)
        .map(|(at, _)| *at)
        .last()
        .unwrap_or(now);

    let minutes = (now - streak_start).num_minutes().max(0);
    i32::try_from(minutes).unwrap_or(i32::MAX)
}

/// Callers are in warmup for a fixed span after onboarding.
pub fn warmup_active(now: DateTime<Utc>, created_at: DateTime<Utc>, policy: &Enforcement) -> bool {
    now - created_at < chrono::Duration::minutes(policy.warmup_minutes)
}
