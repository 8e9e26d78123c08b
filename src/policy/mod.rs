//! Pure enforcement policy: no I/O, no clock reads.
//!
//! The data-access code gathers inputs and applies the results; everything
//! here is a plain function of its arguments.

pub mod allocation;
pub mod fraud;

pub use allocation::{StatusInputs, derive_status, low_rate_minutes, warmup_active};
pub use fraud::{FraudAssessment, FraudInputs, evaluate_fraud, fraud_target};
